use crate::common::{apply_pass, find_nodes, init_tracing};
use umbra_core::ast::{Ast, NodeId, NodeKind};
use umbra_core::codegen::generate;
use umbra_transform::flatten::Flatten;
use umbra_transform::options::Options;
use umbra_transform::probability::ProbabilitySpec;

fn flatten_options() -> Options {
    Options {
        flatten: ProbabilitySpec::Bool(true),
        ..Options::default()
    }
}

/// `function outer() { var x = 10; function inner() { return x; } return inner(); }`
fn capture_program(ast: &mut Ast) -> NodeId {
    let ten = ast.number(10.0);
    let x = ast.var_decl("x", Some(ten));
    let x_ref = ast.ident("x");
    let inner_ret = ast.ret(Some(x_ref));
    let inner_body = ast.block(vec![inner_ret]);
    let inner = ast.func_decl("inner", vec![], inner_body);
    let inner_ref = ast.ident("inner");
    let call = ast.call(inner_ref, vec![]);
    let ret = ast.ret(Some(call));
    let outer_body = ast.block(vec![x, inner, ret]);
    let outer = ast.func_decl("outer", vec![], outer_body);
    ast.program(vec![outer])
}

fn top_level_flat_decls(ast: &Ast, program: NodeId, suffix: &str) -> Vec<String> {
    let NodeKind::Program { body } = ast.kind(program) else {
        unreachable!()
    };
    let mut names = Vec::new();
    for stmt in body {
        if let NodeKind::VariableDeclaration { declarations, .. } = ast.kind(*stmt) {
            for decl in declarations {
                if let NodeKind::VariableDeclarator { id, .. } = ast.kind(*decl) {
                    if let Some(name) = ast.ident_name(*id) {
                        if name.starts_with("__p_") && name.contains(suffix) {
                            names.push(name.to_string());
                        }
                    }
                }
            }
        }
    }
    names
}

#[test]
fn inner_functions_get_their_own_top_level_flat_function() {
    init_tracing();
    let mut ast = Ast::new();
    let program = capture_program(&mut ast);

    let changed = apply_pass(&mut Flatten, &mut ast, program, &flatten_options(), 9);
    assert!(changed, "the capture program must flatten");

    let inner_flats = top_level_flat_decls(&ast, program, "_flat_inner");
    assert_eq!(
        inner_flats.len(),
        1,
        "inner must be isolated even though outer is flattened too"
    );

    let src = generate(&ast, program).expect("flattened tree must print");
    assert!(
        src.contains("_flat_inner"),
        "the flat function name appears in output: {src}"
    );
}

#[test]
fn returns_are_rewritten_into_the_result_box() {
    let mut ast = Ast::new();
    let program = capture_program(&mut ast);
    apply_pass(&mut Flatten, &mut ast, program, &flatten_options(), 9);

    // Inside the flat body of `inner` (which holds no nested functions),
    // each original return became an assignment to result.<prop> followed
    // by a bare return.
    let flat_inner: Vec<NodeId> = find_nodes(&ast, program, |ast, id| {
        matches!(ast.kind(id), NodeKind::VariableDeclarator { id: name, init: Some(init) }
            if ast.ident_name(*name).is_some_and(|n| n.contains("_flat_inner"))
                && matches!(ast.kind(*init), NodeKind::FunctionExpression(_)))
    });
    assert_eq!(flat_inner.len(), 1);
    let NodeKind::VariableDeclarator {
        init: Some(init), ..
    } = ast.kind(flat_inner[0])
    else {
        unreachable!()
    };
    let returns_with_values = find_nodes(&ast, *init, |ast, id| {
        matches!(ast.kind(id), NodeKind::ReturnStatement { argument: Some(_) })
    });
    assert!(
        returns_with_values.is_empty(),
        "the flat body only returns through the result box"
    );
    let box_writes = find_nodes(&ast, *init, |ast, id| {
        matches!(ast.kind(id), NodeKind::AssignmentExpression { left, .. }
            if matches!(ast.kind(*left), NodeKind::MemberExpression { .. }))
    });
    assert!(
        !box_writes.is_empty(),
        "the return value is written into the result box"
    );
}

#[test]
fn the_wrapper_returns_the_boxed_value_conditionally() {
    let mut ast = Ast::new();
    let program = capture_program(&mut ast);
    apply_pass(&mut Flatten, &mut ast, program, &flatten_options(), 9);

    // The wrapper ends in `if (result.<prop>) return result.<prop>.<key>;`.
    let guarded_returns = find_nodes(&ast, program, |ast, id| {
        matches!(ast.kind(id), NodeKind::IfStatement { test, consequent, alternate: None }
            if matches!(ast.kind(*test), NodeKind::MemberExpression { .. })
                && !find_nodes(ast, *consequent, |ast, n| {
                    matches!(ast.kind(n), NodeKind::ReturnStatement { argument: Some(arg) }
                        if matches!(ast.kind(*arg), NodeKind::MemberExpression { .. }))
                })
                .is_empty())
    });
    assert!(
        !guarded_returns.is_empty(),
        "wrappers return the boxed value behind a member guard"
    );
}

#[test]
fn functions_using_this_are_skipped() {
    init_tracing();
    let mut ast = Ast::new();
    // function m() { return this.x; }
    let this = ast.this_expr();
    let member = ast.member(this, "x");
    let ret = ast.ret(Some(member));
    let body = ast.block(vec![ret]);
    let m = ast.func_decl("m", vec![], body);
    let program = ast.program(vec![m]);

    let changed = apply_pass(&mut Flatten, &mut ast, program, &flatten_options(), 9);
    assert!(!changed, "a bound function cannot be moved");
    let NodeKind::Program { body } = ast.kind(program) else {
        unreachable!()
    };
    assert_eq!(body.len(), 1, "nothing was added");
}

#[test]
fn try_statements_block_the_move() {
    let mut ast = Ast::new();
    // function t() { try { return 1; } catch (e) { return 2; } }
    let one = ast.number(1.0);
    let r1 = ast.ret(Some(one));
    let try_block = ast.block(vec![r1]);
    let two = ast.number(2.0);
    let r2 = ast.ret(Some(two));
    let catch_body = ast.block(vec![r2]);
    let e = ast.ident("e");
    let handler = ast.alloc(NodeKind::CatchClause {
        param: Some(e),
        body: catch_body,
    });
    let try_stmt = ast.alloc(NodeKind::TryStatement {
        block: try_block,
        handler: Some(handler),
        finalizer: None,
    });
    let body = ast.block(vec![try_stmt]);
    let t = ast.func_decl("t", vec![], body);
    let program = ast.program(vec![t]);

    let changed = apply_pass(&mut Flatten, &mut ast, program, &flatten_options(), 9);
    assert!(!changed, "try statements disqualify the body");
}

#[test]
fn modified_captures_are_threaded_back_out() {
    let mut ast = Ast::new();
    // function bump() { counter += 1; return counter; }  with counter above.
    let zero = ast.number(0.0);
    let counter = ast.var_decl("counter", Some(zero));
    let c_w = ast.ident("counter");
    let one = ast.number(1.0);
    let add = ast.assign_op(umbra_core::ast::AssignOp::Add, c_w, one);
    let add_stmt = ast.expr_stmt(add);
    let c_r = ast.ident("counter");
    let ret = ast.ret(Some(c_r));
    let body = ast.block(vec![add_stmt, ret]);
    let bump = ast.func_decl("bump", vec![], body);
    let program = ast.program(vec![counter, bump]);

    let changed = apply_pass(&mut Flatten, &mut ast, program, &flatten_options(), 9);
    assert!(changed, "a function writing an outer var still flattens");

    // The wrapper restores counter from the result box.
    let restores = find_nodes(&ast, program, |ast, id| {
        matches!(ast.kind(id), NodeKind::AssignmentExpression { left, right, .. }
            if ast.ident_name(*left) == Some("counter")
                && matches!(ast.kind(*right), NodeKind::MemberExpression { .. }))
    });
    assert_eq!(restores.len(), 1, "one write-back for the modified capture");
}
