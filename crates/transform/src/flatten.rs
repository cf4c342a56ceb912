//! The flatten pass.
//!
//! Hoists an eligible function's body into a top-level "flat" function that
//! receives three arrays: the captured variables it reads, the original
//! arguments, and a result box. Returns inside the moved body become writes
//! into the box; the original function shrinks to a wrapper that calls the
//! flat function, restores modified captures, and returns the boxed value
//! behind a screen of decoy branches.

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;
use umbra_core::ast::{Ast, Function, Literal, NodeId, NodeKind, PropertyKind, UnaryOp};
use umbra_core::scope::{
    collect_usage, defined_above, is_bound, is_reserved, references_arguments, scan, Descend,
};
use umbra_core::visit::Ancestors;
use umbra_utils::errors::TransformError;

use crate::probability::DecideContext;
use crate::{priority, Mutation, PassContext, Transform};

pub struct Flatten;

impl Flatten {
    fn eligible_shape(ast: &Ast, node: NodeId, ancestors: &Ancestors<'_>) -> bool {
        let Some(f) = ast.kind(node).as_function() else {
            return false;
        };
        if matches!(ast.kind(node), NodeKind::ArrowFunctionExpression(_)) {
            return false;
        }
        if f.is_generator || f.expression_body {
            return false;
        }
        if !f
            .params
            .iter()
            .all(|p| matches!(ast.kind(*p), NodeKind::Identifier { .. }))
        {
            return false;
        }
        // Methods and accessors keep their home object semantics.
        if let Some(parent) = ancestors.parent() {
            match ast.kind(parent) {
                NodeKind::MethodDefinition { .. } => return false,
                NodeKind::Property { kind, .. } if *kind != PropertyKind::Init => return false,
                _ => {}
            }
        }
        matches!(ast.kind(f.body), NodeKind::BlockStatement { .. })
    }

    /// Constructs the moved body may not contain: `try`, `arguments`,
    /// `this`/`super`, meta properties, or lexical declarations.
    fn body_allows_move(ast: &Ast, node: NodeId, body: NodeId) -> bool {
        if is_bound(ast, node) || references_arguments(ast, node) {
            return false;
        }
        let mut blocked = false;
        scan(ast, body, Descend::SkipNonArrowFunctions, &mut |ast, id, _| {
            if blocked {
                return false;
            }
            match ast.kind(id) {
                NodeKind::TryStatement { .. } | NodeKind::MetaProperty { .. } => {
                    blocked = true;
                    false
                }
                NodeKind::VariableDeclaration { kind, .. } if kind.is_lexical() => {
                    blocked = true;
                    false
                }
                _ => true,
            }
        });
        !blocked
    }

    /// Rewrites every return of the moved body into a result-box write
    /// followed by a bare return.
    fn rewrite_returns(
        ast: &mut Ast,
        body_stmts: &[NodeId],
        result_param: &str,
        prop: &str,
        return_key: &str,
        outputs: &[(String, String)],
    ) {
        let mut returns = Vec::new();
        for stmt in body_stmts {
            scan(ast, *stmt, Descend::SkipFunctions, &mut |ast, id, _| {
                if matches!(ast.kind(id), NodeKind::ReturnStatement { .. }) {
                    returns.push(id);
                }
                true
            });
        }
        for ret in returns {
            let argument = match ast.kind(ret) {
                NodeKind::ReturnStatement { argument } => *argument,
                _ => continue,
            };
            let write =
                Self::result_write(ast, result_param, prop, Some((return_key, argument)), outputs);
            let write_stmt = ast.expr_stmt(write);
            let bare = ast.ret(None);
            ast.replace(
                ret,
                NodeKind::BlockStatement {
                    body: vec![write_stmt, bare],
                },
            );
        }
    }

    /// `result.<prop> = { <returnKey>: value, <outKey>: name, … }`
    fn result_write(
        ast: &mut Ast,
        result_param: &str,
        prop: &str,
        return_value: Option<(&str, Option<NodeId>)>,
        outputs: &[(String, String)],
    ) -> NodeId {
        let mut properties = Vec::new();
        if let Some((return_key, argument)) = return_value {
            let value = argument.unwrap_or_else(|| ast.undefined());
            properties.push(ast.property(return_key, value));
        }
        for (name, out_key) in outputs {
            let value = ast.ident(name.clone());
            properties.push(ast.property(out_key.clone(), value));
        }
        let object = ast.object(properties);
        let result_ref = ast.ident(result_param);
        let slot = ast.member(result_ref, prop);
        ast.assign(slot, object)
    }

    /// The eight decoy templates; each survives with probability 1/4 and the
    /// survivors are shuffled. Every guard reads an absent property of the
    /// result box, so none can fire.
    fn decoys(
        ast: &mut Ast,
        result_var: &str,
        cx: &mut PassContext<'_>,
    ) -> Result<Vec<NodeId>, TransformError> {
        let mut prop = |cx: &mut PassContext<'_>| {
            cx.names.from_spec(
                &cx.options.identifier_generator,
                cx.rng,
                &DecideContext::default(),
            )
        };

        let mut out = Vec::new();
        for template in 0..8u8 {
            if cx.rng.random::<f64>() >= 0.25 {
                continue;
            }
            let p1 = prop(cx)?;
            let p2 = prop(cx)?;
            let result_ref = ast.ident(result_var);
            let guard = ast.member(result_ref, p1.clone());
            let stmt = match template {
                0 => {
                    let body = ast.throw_new_error("unexpected value");
                    let block = ast.block(vec![body]);
                    ast.if_stmt(guard, block, None)
                }
                1 => {
                    let result_ref = ast.ident(result_var);
                    let value = ast.member(result_ref, p2);
                    let ret = ast.ret(Some(value));
                    let block = ast.block(vec![ret]);
                    ast.if_stmt(guard, block, None)
                }
                2 => {
                    let result_ref = ast.ident(result_var);
                    let slot = ast.member(result_ref, p2);
                    let empty = ast.object(vec![]);
                    let write = ast.assign(slot, empty);
                    let stmt = ast.expr_stmt(write);
                    let block = ast.block(vec![stmt]);
                    ast.if_stmt(guard, block, None)
                }
                3 => {
                    let ret = ast.ret(None);
                    let block = ast.block(vec![ret]);
                    ast.if_stmt(guard, block, None)
                }
                4 => {
                    let result_ref = ast.ident(result_var);
                    let test = ast.unary(UnaryOp::Not, result_ref);
                    let ret = ast.ret(None);
                    let block = ast.block(vec![ret]);
                    ast.if_stmt(test, block, None)
                }
                5 => {
                    let callee = ast.ident("TypeError");
                    let msg = ast.string("invalid state");
                    let err = ast.new_expr(callee, vec![msg]);
                    let thrown = ast.alloc(NodeKind::ThrowStatement { argument: err });
                    let block = ast.block(vec![thrown]);
                    ast.if_stmt(guard, block, None)
                }
                6 => {
                    let result_ref = ast.ident(result_var);
                    let first = ast.member(result_ref, p1.clone());
                    let chained = ast.member(first, p2);
                    let ret = ast.ret(Some(chained));
                    let block = ast.block(vec![ret]);
                    ast.if_stmt(guard, block, None)
                }
                _ => {
                    let result_ref = ast.ident(result_var);
                    let empty = ast.object(vec![]);
                    let write = ast.assign(result_ref, empty);
                    let stmt = ast.expr_stmt(write);
                    let block = ast.block(vec![stmt]);
                    ast.if_stmt(guard, block, None)
                }
            };
            out.push(stmt);
        }
        out.shuffle(cx.rng);
        Ok(out)
    }
}

impl Transform for Flatten {
    fn name(&self) -> &'static str {
        "Flatten"
    }

    fn priority(&self) -> i32 {
        priority::FLATTEN
    }

    fn matches(&self, ast: &Ast, node: NodeId, _ancestors: &Ancestors<'_>) -> bool {
        matches!(ast.kind(node), NodeKind::Program { .. })
    }

    /// Drives the whole pass from the program root: candidates are
    /// collected up front and flattened deepest-first, so an inner function
    /// is isolated before its enclosing function carries it away into a
    /// flat body the walk would never revisit.
    fn mutate(
        &mut self,
        ast: &mut Ast,
        node: NodeId,
        _ancestors: &Ancestors<'_>,
        cx: &mut PassContext<'_>,
    ) -> Result<Mutation, TransformError> {
        let mut sites: Vec<(NodeId, Vec<NodeId>, usize)> = Vec::new();
        scan(ast, node, Descend::All, &mut |ast, id, ancestors| {
            if matches!(
                ast.kind(id),
                NodeKind::FunctionDeclaration(_) | NodeKind::FunctionExpression(_)
            ) {
                sites.push((id, ancestors.root_first().to_vec(), ancestors.len()));
            }
            true
        });
        sites.sort_by(|a, b| b.2.cmp(&a.2));

        let mut changed = false;
        for (id, chain, _) in &sites {
            let ancestors = Ancestors::new(chain);
            changed |= Self::try_flatten(ast, *id, &ancestors, cx)?;
        }
        Ok(if changed {
            Mutation::rewrote()
        } else {
            Mutation::none()
        })
    }
}

impl Flatten {
    fn try_flatten(
        ast: &mut Ast,
        node: NodeId,
        ancestors: &Ancestors<'_>,
        cx: &mut PassContext<'_>,
    ) -> Result<bool, TransformError> {
        if !Self::eligible_shape(ast, node, ancestors) {
            return Ok(false);
        }
        let Some(&program) = ancestors.root_first().first() else {
            return Ok(false);
        };
        if !matches!(ast.kind(program), NodeKind::Program { .. }) {
            return Ok(false);
        }

        let f = ast.kind(node).as_function().expect("eligible shape").clone();
        let fn_name = f.id.and_then(|id| ast.ident_name(id)).map(str::to_string);
        if !cx.options.flatten.roll(
            cx.rng,
            &DecideContext {
                name: fn_name.as_deref(),
            },
        ) {
            return Ok(false);
        }
        if !Self::body_allows_move(ast, node, f.body) {
            return Ok(false);
        }

        let sets = collect_usage(ast, node);
        if fn_name.as_deref().is_some_and(|n| sets.modified.contains(n)) {
            return Ok(false);
        }

        let mut input: Vec<String> = sets
            .free()
            .into_iter()
            .filter(|n| !is_reserved(n))
            .collect();
        input.sort();
        // A recursive reference to the function's own name is threaded in as
        // a capture: at call time it resolves to the wrapper itself.
        if let Some(name) = &fn_name {
            if sets.referenced.contains(name) && !input.contains(name) {
                input.push(name.clone());
            }
        }
        for name in &input {
            if Some(name) != fn_name.as_ref()
                && !defined_above(ast, name, ancestors, &cx.options.global_variables)
            {
                debug!("skipping flatten of `{:?}`: `{}` not defined above", fn_name, name);
                return Ok(false);
            }
        }
        let mut output: Vec<String> = sets
            .modified
            .iter()
            .filter(|n| !sets.defined.contains(*n) && !is_reserved(n))
            .cloned()
            .collect();
        output.sort();

        // Names for the new machinery.
        let placeholder = cx.names.placeholder(cx.rng);
        let flat_name = match &fn_name {
            Some(n) => format!("{placeholder}_flat_{n}"),
            None => format!("{placeholder}_flat"),
        };
        let mut key = |cx: &mut PassContext<'_>| {
            cx.names.from_spec(
                &cx.options.identifier_generator,
                cx.rng,
                &DecideContext::default(),
            )
        };
        let prop = key(cx)?;
        let return_key = key(cx)?;
        let outputs: Vec<(String, String)> = output
            .iter()
            .map(|name| Ok((name.clone(), key(cx)?)))
            .collect::<Result<_, TransformError>>()?;
        let input_param = cx.names.placeholder(cx.rng);
        let args_param = cx.names.placeholder(cx.rng);
        let result_param = cx.names.placeholder(cx.rng);
        let result_var = cx.names.placeholder(cx.rng);

        // Assemble the flat function body.
        let original_stmts: Vec<NodeId> = match ast.kind(f.body) {
            NodeKind::BlockStatement { body } => body
                .iter()
                .copied()
                .filter(|stmt| !is_use_strict(ast, *stmt))
                .collect(),
            _ => return Ok(false),
        };
        let ends_in_return = original_stmts
            .last()
            .is_some_and(|s| matches!(ast.kind(*s), NodeKind::ReturnStatement { .. }));
        Self::rewrite_returns(
            ast,
            &original_stmts,
            &result_param,
            &prop,
            &return_key,
            &outputs,
        );

        let mut flat_stmts = Vec::new();
        if !input.is_empty() {
            let elements: Vec<NodeId> = input.iter().map(|n| ast.ident(n.clone())).collect();
            let init = ast.ident(input_param.clone());
            flat_stmts.push(ast.var_array_pattern(elements, init));
        }
        let param_names: Vec<String> = f
            .params
            .iter()
            .filter_map(|p| ast.ident_name(*p).map(str::to_string))
            .collect();
        if !param_names.is_empty() {
            let elements: Vec<NodeId> =
                param_names.iter().map(|n| ast.ident(n.clone())).collect();
            let init = ast.ident(args_param.clone());
            flat_stmts.push(ast.var_array_pattern(elements, init));
        }
        flat_stmts.extend(original_stmts);
        if !outputs.is_empty() && !ends_in_return {
            let write = Self::result_write(ast, &result_param, &prop, None, &outputs);
            flat_stmts.push(ast.expr_stmt(write));
        }

        let flat_params = vec![
            ast.ident(input_param),
            ast.ident(args_param),
            ast.ident(result_param),
        ];
        let flat_body = ast.block(flat_stmts);
        let flat_fn = ast.alloc(NodeKind::FunctionExpression(Function {
            id: None,
            params: flat_params,
            body: flat_body,
            is_async: f.is_async,
            is_generator: false,
            expression_body: false,
        }));
        let flat_decl = ast.var_decl(flat_name.clone(), Some(flat_fn));
        ast.annotations_mut(flat_decl).hidden = true;
        if let NodeKind::Program { body } = ast.kind_mut(program) {
            body.insert(0, flat_decl);
        }

        // The wrapper body.
        let mut wrapper = Vec::new();
        let empty = ast.object(vec![]);
        wrapper.push(ast.var_decl(result_var.clone(), Some(empty)));

        let input_values: Vec<NodeId> = input.iter().map(|n| ast.ident(n.clone())).collect();
        let arg_values: Vec<NodeId> = param_names
            .iter()
            .map(|n| ast.ident(n.clone()))
            .collect();
        let input_array = ast.array(input_values);
        let args_array = ast.array(arg_values);
        let result_ref = ast.ident(result_var.clone());
        let flat_ref = ast.ident(flat_name);
        let mut invocation = ast.call(flat_ref, vec![input_array, args_array, result_ref]);
        if f.is_async {
            invocation = ast.await_expr(invocation);
        }
        wrapper.push(ast.expr_stmt(invocation));

        for (name, out_key) in outputs.iter().rev() {
            let result_ref = ast.ident(result_var.clone());
            let boxed = ast.member(result_ref, prop.clone());
            let value = ast.member(boxed, out_key.clone());
            let target = ast.ident(name.clone());
            let restore = ast.assign(target, value);
            wrapper.push(ast.expr_stmt(restore));
        }

        wrapper.extend(Self::decoys(ast, &result_var, cx)?);

        let result_ref = ast.ident(result_var.clone());
        let guard = ast.member(result_ref, prop.clone());
        let result_ref = ast.ident(result_var);
        let boxed = ast.member(result_ref, prop);
        let value = ast.member(boxed, return_key);
        let ret = ast.ret(Some(value));
        let ret_block = ast.block(vec![ret]);
        wrapper.push(ast.if_stmt(guard, ret_block, None));

        let new_body = ast.block(wrapper);
        if let Some(func) = ast.kind_mut(node).as_function_mut() {
            func.body = new_body;
        }

        debug!(
            "flattened `{:?}` with {} captures and {} outputs",
            fn_name,
            input.len(),
            outputs.len()
        );
        Ok(true)
    }
}

/// `"use strict"` as an expression statement.
fn is_use_strict(ast: &Ast, stmt: NodeId) -> bool {
    matches!(
        ast.kind(stmt),
        NodeKind::ExpressionStatement { expression }
            if matches!(
                ast.kind(*expression),
                NodeKind::Literal(Literal::String(s)) if s == "use strict"
            )
    )
}
