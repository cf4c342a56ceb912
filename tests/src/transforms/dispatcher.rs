use crate::common::{apply_pass, count_kind, find_nodes, init_tracing};
use umbra_core::ast::{Ast, BinaryOp, Function, Literal, NodeId, NodeKind};
use umbra_core::codegen::generate;
use umbra_transform::dispatcher::Dispatcher;
use umbra_transform::options::Options;
use umbra_transform::probability::ProbabilitySpec;

fn dispatcher_options() -> Options {
    Options {
        dispatcher: ProbabilitySpec::Bool(true),
        ..Options::default()
    }
}

/// `function g() { function h(x) { return x * 2; } return h(3) + h(4); }`
fn doubling_program(ast: &mut Ast) -> (NodeId, NodeId) {
    let x_param = ast.ident("x");
    let x_ref = ast.ident("x");
    let two = ast.number(2.0);
    let doubled = ast.binary(BinaryOp::Mul, x_ref, two);
    let h_ret = ast.ret(Some(doubled));
    let h_body = ast.block(vec![h_ret]);
    let h = ast.func_decl("h", vec![x_param], h_body);

    let h_ref1 = ast.ident("h");
    let three = ast.number(3.0);
    let call1 = ast.call(h_ref1, vec![three]);
    let h_ref2 = ast.ident("h");
    let four = ast.number(4.0);
    let call2 = ast.call(h_ref2, vec![four]);
    let sum = ast.binary(BinaryOp::Add, call1, call2);
    let ret = ast.ret(Some(sum));

    let g_body = ast.block(vec![h, ret]);
    let g = ast.func_decl("g", vec![], g_body);
    let program = ast.program(vec![g]);
    (program, g)
}

#[test]
fn declarations_move_into_the_table() {
    init_tracing();
    let mut ast = Ast::new();
    let (program, g) = doubling_program(&mut ast);

    let changed = apply_pass(&mut Dispatcher, &mut ast, program, &dispatcher_options(), 4);
    assert!(changed, "one eligible declaration should dispatch");

    let declared_h = find_nodes(&ast, g, |ast, id| {
        matches!(ast.kind(id), NodeKind::FunctionDeclaration(f)
            if f.id.and_then(|i| ast.ident_name(i)) == Some("h"))
    });
    assert!(declared_h.is_empty(), "function h must no longer be declared");

    // The table carries h as a keyed function expression.
    let table_entries = find_nodes(&ast, g, |ast, id| {
        matches!(ast.kind(id), NodeKind::Property { value, .. }
            if matches!(ast.kind(*value), NodeKind::FunctionExpression(_)))
    });
    assert_eq!(table_entries.len(), 1, "exactly one table entry for h");

    // No call site still names h.
    let h_calls = find_nodes(&ast, g, |ast, id| {
        matches!(ast.kind(id), NodeKind::CallExpression { callee, .. }
            if ast.ident_name(*callee) == Some("h"))
    });
    assert!(h_calls.is_empty(), "call sites must go through the dispatcher");

    let src = generate(&ast, program).expect("dispatched tree must print");
    assert!(
        !src.contains("function h("),
        "no trace of the declaration in output: {src}"
    );
}

#[test]
fn arguments_travel_through_the_payload() {
    let mut ast = Ast::new();
    let (program, g) = doubling_program(&mut ast);
    apply_pass(&mut Dispatcher, &mut ast, program, &dispatcher_options(), 4);

    // Every argument-carrying call fills an array before dispatching:
    // (payload = [3], dispatcher(key)) or its new-form sibling.
    let payload_fills = find_nodes(&ast, g, |ast, id| {
        matches!(ast.kind(id), NodeKind::SequenceExpression { expressions }
            if expressions.first().is_some_and(|e| {
                matches!(ast.kind(*e), NodeKind::AssignmentExpression { right, .. }
                    if matches!(ast.kind(*right), NodeKind::ArrayExpression { elements }
                        if !elements.is_empty()))
            }))
    });
    assert_eq!(payload_fills.len(), 2, "both call sites fill the payload");
}

#[test]
fn the_embedded_function_reads_parameters_from_the_payload() {
    let mut ast = Ast::new();
    let (program, g) = doubling_program(&mut ast);
    apply_pass(&mut Dispatcher, &mut ast, program, &dispatcher_options(), 4);

    // var [x] = payload; inside the embedded function.
    let destructures = find_nodes(&ast, g, |ast, id| {
        matches!(ast.kind(id), NodeKind::VariableDeclarator { id: pattern, .. }
            if matches!(ast.kind(*pattern), NodeKind::ArrayPattern { elements }
                if elements.iter().any(|e| ast.ident_name(*e) == Some("x"))))
    });
    assert_eq!(
        destructures.len(),
        1,
        "the original parameter list becomes a payload destructuring"
    );

    // Three fresh parameters on the embedded function.
    let embedded = find_nodes(&ast, g, |ast, id| {
        matches!(ast.kind(id), NodeKind::Property { value, .. }
            if matches!(ast.kind(*value), NodeKind::FunctionExpression(_)))
    });
    let NodeKind::Property { value, .. } = ast.kind(embedded[0]) else {
        unreachable!()
    };
    let NodeKind::FunctionExpression(f) = ast.kind(*value) else {
        unreachable!()
    };
    assert_eq!(f.params.len(), 3, "three decoy parameters are added");
}

#[test]
fn the_decoy_prologue_cannot_fire_on_real_calls() {
    init_tracing();
    let mut ast = Ast::new();
    let (program, g) = doubling_program(&mut ast);
    apply_pass(&mut Dispatcher, &mut ast, program, &dispatcher_options(), 4);

    // Every table invocation `M[x].call(this, opaque)` — the direct one and
    // the one inside the getter closure — must bind the embedded function's
    // first added parameter to a truthy value, so the `if (!a0) return`
    // decoy arm is unreachable from a real call.
    let invocations = find_nodes(&ast, g, |ast, id| {
        matches!(ast.kind(id), NodeKind::CallExpression { callee, .. }
            if matches!(ast.kind(*callee), NodeKind::MemberExpression { object, property, computed: false }
                if ast.ident_name(*property) == Some("call")
                    && matches!(ast.kind(*object), NodeKind::MemberExpression { computed: true, .. })))
    });
    assert!(
        invocations.len() >= 2,
        "both table invocation paths should be present, found {}",
        invocations.len()
    );
    for call in invocations {
        let NodeKind::CallExpression { arguments, .. } = ast.kind(call) else {
            unreachable!()
        };
        assert_eq!(
            arguments.len(),
            2,
            "table entries are invoked with `this` plus the opaque argument"
        );
        let NodeKind::Literal(Literal::String(opaque)) = ast.kind(arguments[1]) else {
            panic!("the opaque argument must be a string literal");
        };
        assert!(
            !opaque.is_empty(),
            "an empty opaque string would be falsy and take the decoy arm"
        );
    }
}

#[test]
fn call_sites_under_await_disable_the_function() {
    init_tracing();
    let mut ast = Ast::new();
    // async function g() { function h() { return 1; } return await h(); }
    let one = ast.number(1.0);
    let h_ret = ast.ret(Some(one));
    let h_body = ast.block(vec![h_ret]);
    let h = ast.func_decl("h", vec![], h_body);
    let h_ref = ast.ident("h");
    let call = ast.call(h_ref, vec![]);
    let awaited = ast.await_expr(call);
    let ret = ast.ret(Some(awaited));
    let g_body = ast.block(vec![h, ret]);
    let g_id = ast.ident("g");
    let g = ast.alloc(NodeKind::FunctionDeclaration(Function {
        id: Some(g_id),
        params: vec![],
        body: g_body,
        is_async: true,
        is_generator: false,
        expression_body: false,
    }));
    let program = ast.program(vec![g]);

    let changed = apply_pass(&mut Dispatcher, &mut ast, program, &dispatcher_options(), 4);
    assert!(!changed, "an awaited call site pins the declaration");
    assert_eq!(
        count_kind(&ast, program, "FunctionDeclaration"),
        2,
        "both g and h survive untouched"
    );
}

#[test]
fn reassigned_names_are_not_collected() {
    let mut ast = Ast::new();
    // function g() { function h() { return 1; } h = null; return h(); }
    let one = ast.number(1.0);
    let h_ret = ast.ret(Some(one));
    let h_body = ast.block(vec![h_ret]);
    let h = ast.func_decl("h", vec![], h_body);
    let h_w = ast.ident("h");
    let null = ast.null_lit();
    let clobber = ast.assign(h_w, null);
    let clobber_stmt = ast.expr_stmt(clobber);
    let h_ref = ast.ident("h");
    let call = ast.call(h_ref, vec![]);
    let ret = ast.ret(Some(call));
    let g_body = ast.block(vec![h, clobber_stmt, ret]);
    let g = ast.func_decl("g", vec![], g_body);
    let program = ast.program(vec![g]);

    let changed = apply_pass(&mut Dispatcher, &mut ast, program, &dispatcher_options(), 4);
    assert!(!changed, "a reassigned name cannot be dispatched");
}
