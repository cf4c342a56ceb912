use crate::common::{apply_pass, find_nodes, init_tracing};
use umbra_core::ast::{Ast, Function, Literal, NodeId, NodeKind, UpdateOp};
use umbra_core::codegen::generate;
use umbra_transform::options::Options;
use umbra_transform::probability::ProbabilitySpec;
use umbra_transform::rgf::Rgf;

fn rgf_options() -> Options {
    Options {
        rgf: ProbabilitySpec::Mode("all".to_string()),
        ..Options::default()
    }
}

/// `var z = 0; function p() { z++; return z; } p(); p();`
fn counter_program(ast: &mut Ast) -> NodeId {
    let zero = ast.number(0.0);
    let z = ast.var_decl("z", Some(zero));

    let z_ref = ast.ident("z");
    let bump = ast.alloc(NodeKind::UpdateExpression {
        op: UpdateOp::Increment,
        prefix: false,
        argument: z_ref,
    });
    let bump_stmt = ast.expr_stmt(bump);
    let z_out = ast.ident("z");
    let ret = ast.ret(Some(z_out));
    let p_body = ast.block(vec![bump_stmt, ret]);
    let p = ast.func_decl("p", vec![], p_body);

    let p_ref1 = ast.ident("p");
    let call1 = ast.call(p_ref1, vec![]);
    let call1_stmt = ast.expr_stmt(call1);
    let p_ref2 = ast.ident("p");
    let call2 = ast.call(p_ref2, vec![]);
    let call2_stmt = ast.expr_stmt(call2);

    ast.program(vec![z, p, call1_stmt, call2_stmt])
}

#[test]
fn eligible_functions_become_runtime_compiled_stubs() {
    init_tracing();
    let mut ast = Ast::new();
    let program = counter_program(&mut ast);

    let changed = apply_pass(&mut Rgf, &mut ast, program, &rgf_options(), 6);
    assert!(changed, "p only touches a program-level var, so it extracts");

    let src = generate(&ast, program).expect("tree must print");
    assert!(
        src.contains("new Function("),
        "the stub is built through the runtime constructor: {src}"
    );

    // The reference array is declared and slot 0 is assigned exactly once.
    let NodeKind::Program { body } = ast.kind(program) else {
        unreachable!()
    };
    let body = body.clone();
    let array_decl = body.first().copied().expect("program is non-empty");
    assert!(
        matches!(ast.kind(array_decl), NodeKind::VariableDeclaration { declarations, .. }
            if declarations.len() == 1
                && matches!(ast.kind(declarations[0]), NodeKind::VariableDeclarator { init: Some(init), .. }
                    if matches!(ast.kind(*init), NodeKind::ArrayExpression { elements } if elements.is_empty()))),
        "the reference array leads the context body"
    );
    assert!(
        ast.annotations(array_decl).hidden,
        "synthetic declarations carry the hidden annotation"
    );

    let slot_assignments = find_nodes(&ast, program, |ast, id| {
        matches!(ast.kind(id), NodeKind::AssignmentExpression { left, right, .. }
            if matches!(ast.kind(*left), NodeKind::MemberExpression { computed: true, property, .. }
                if matches!(ast.kind(*property), NodeKind::Literal(Literal::Number(n)) if *n == 0.0))
                && matches!(ast.kind(*right), NodeKind::CallExpression { .. }))
    });
    assert_eq!(slot_assignments.len(), 1, "R[0] is assigned exactly once");

    // No declaration of p survives, and no call site names it.
    let p_decls = find_nodes(&ast, program, |ast, id| {
        matches!(ast.kind(id), NodeKind::FunctionDeclaration(f)
            if f.id.and_then(|i| ast.ident_name(i)) == Some("p"))
    });
    assert!(p_decls.is_empty(), "p is dissolved into the array");
    let p_calls = find_nodes(&ast, program, |ast, id| {
        matches!(ast.kind(id), NodeKind::CallExpression { callee, .. }
            if ast.ident_name(*callee) == Some("p"))
    });
    assert!(p_calls.is_empty(), "calls route through the reference array");
}

#[test]
fn references_go_through_the_signature_guard() {
    let mut ast = Ast::new();
    let program = counter_program(&mut ast);
    apply_pass(&mut Rgf, &mut ast, program, &rgf_options(), 6);

    // Every replaced reference is the conditional
    //   typeof R[0] === "function" && R[0][sig] ? <wrapper> : R[0]
    let guards = find_nodes(&ast, program, |ast, id| {
        matches!(ast.kind(id), NodeKind::ConditionalExpression { test, .. }
            if matches!(ast.kind(*test), NodeKind::LogicalExpression { left, .. }
                if matches!(ast.kind(*left), NodeKind::BinaryExpression { left: typeof_side, .. }
                    if matches!(ast.kind(*typeof_side), NodeKind::UnaryExpression { .. }))))
    });
    assert_eq!(guards.len(), 2, "both call sites are guarded");
}

#[test]
fn arrow_functions_are_not_extracted() {
    init_tracing();
    let mut ast = Ast::new();
    // var a = () => 1;  a();
    let one = ast.number(1.0);
    let arrow = ast.alloc(NodeKind::ArrowFunctionExpression(Function {
        id: None,
        params: vec![],
        body: one,
        is_async: false,
        is_generator: false,
        expression_body: true,
    }));
    let a = ast.var_decl("a", Some(arrow));
    let a_ref = ast.ident("a");
    let call = ast.call(a_ref, vec![]);
    let call_stmt = ast.expr_stmt(call);
    let program = ast.program(vec![a, call_stmt]);

    let changed = apply_pass(&mut Rgf, &mut ast, program, &rgf_options(), 6);
    assert!(!changed, "arrows are never runtime-compiled");
    let src = generate(&ast, program).unwrap();
    assert!(!src.contains("new Function("), "no stub was built: {src}");
}

#[test]
fn functions_capturing_locals_stay_put() {
    let mut ast = Ast::new();
    // function outer() { var secret = 1;
    //   function leak() { return secret; } return leak(); }
    let one = ast.number(1.0);
    let secret = ast.var_decl("secret", Some(one));
    let secret_ref = ast.ident("secret");
    let leak_ret = ast.ret(Some(secret_ref));
    let leak_body = ast.block(vec![leak_ret]);
    let leak = ast.func_decl("leak", vec![], leak_body);
    let leak_ref = ast.ident("leak");
    let call = ast.call(leak_ref, vec![]);
    let ret = ast.ret(Some(call));
    let outer_body = ast.block(vec![secret, leak, ret]);
    let outer = ast.func_decl("outer", vec![], outer_body);
    let program = ast.program(vec![outer]);

    apply_pass(&mut Rgf, &mut ast, program, &rgf_options(), 6);
    // `outer` has no free names and extracts; `leak` references a local of
    // `outer`, which no compiled stub of its own could reach, so it rides
    // along inside outer's source text as an ordinary declaration.
    let stub_sources: Vec<String> = find_nodes(&ast, program, |ast, id| {
        matches!(ast.kind(id), NodeKind::NewExpression { callee, .. }
            if ast.ident_name(*callee) == Some("Function"))
    })
    .into_iter()
    .filter_map(|id| match ast.kind(id) {
        NodeKind::NewExpression { arguments, .. } => arguments.get(1).copied(),
        _ => None,
    })
    .filter_map(|arg| match ast.kind(arg) {
        NodeKind::Literal(Literal::String(s)) => Some(s.clone()),
        _ => None,
    })
    .collect();
    assert_eq!(stub_sources.len(), 1, "only outer is compiled to a stub");
    assert!(
        stub_sources[0].contains("function leak("),
        "leak stays a plain declaration inside the stub: {}",
        stub_sources[0]
    );
}

#[test]
fn the_countermeasures_function_is_exempt() {
    let mut ast = Ast::new();
    let program = counter_program(&mut ast);
    let options = Options {
        rgf: ProbabilitySpec::Mode("all".to_string()),
        lock: umbra_transform::options::LockOptions {
            countermeasures: Some("p".to_string()),
        },
        ..Options::default()
    };
    let changed = apply_pass(&mut Rgf, &mut ast, program, &options, 6);
    assert!(!changed, "the countermeasures hook must stay callable by name");
}
