//! The dispatcher pass.
//!
//! Collects the eligible function declarations of a function-like var
//! context into a table keyed by opaque strings, served by a single
//! dispatcher function. Arguments travel through a shared `payload` array
//! rather than argument lists, call sites become table invocations, and
//! passive reads go through a caching getter, so the original functions
//! disappear both as declarations and as names.

use std::collections::HashMap;

use rand::Rng;
use tracing::debug;
use umbra_core::ast::{Ast, BinaryOp, Function, LogicalOp, NodeId, NodeKind, UnaryOp};
use umbra_core::scope::{classify, is_bound, references_arguments, scan, Descend, IdentUsage};
use umbra_core::visit::Ancestors;
use umbra_utils::errors::TransformError;

use crate::probability::DecideContext;
use crate::{priority, Mutation, PassContext, Transform};

pub struct Dispatcher;

/// One rewritable reference to a collected function.
enum Site {
    /// `f(args)` with the identifier in callee position.
    Call {
        call: NodeId,
        name: String,
        arguments: Vec<NodeId>,
    },
    /// A passive read of `f`.
    Read { ident: NodeId, name: String },
}

struct Names {
    payload: String,
    cache: String,
    dispatcher: String,
    clear_sentinel: String,
    get_sentinel: String,
    new_sentinel: String,
    member_key: String,
    opaque_arg: String,
}

impl Dispatcher {
    fn generate_names(cx: &mut PassContext<'_>) -> Result<Names, TransformError> {
        let mut next = || {
            cx.names.from_spec(
                &cx.options.identifier_generator,
                cx.rng,
                &DecideContext::default(),
            )
        };
        Ok(Names {
            payload: next()?,
            cache: next()?,
            dispatcher: next()?,
            clear_sentinel: next()?,
            get_sentinel: next()?,
            new_sentinel: next()?,
            member_key: next()?,
            opaque_arg: next()?,
        })
    }

    /// Direct function declarations of the context body that qualify for
    /// collection. A name that is reassigned, redeclared or shadowed
    /// anywhere in the context disqualifies its function.
    fn collect_candidates(ast: &Ast, ctx: NodeId, body: &[NodeId]) -> Vec<(NodeId, String)> {
        let mut candidates: Vec<(NodeId, String)> = Vec::new();
        for stmt in body {
            let NodeKind::FunctionDeclaration(f) = ast.kind(*stmt) else {
                continue;
            };
            let Some(name) = f.id.and_then(|id| ast.ident_name(id)) else {
                continue;
            };
            if f.is_async || f.is_generator {
                continue;
            }
            if ast.annotations(*stmt).requires_eval {
                continue;
            }
            if !matches!(ast.kind(f.body), NodeKind::BlockStatement { .. }) {
                continue;
            }
            if is_bound(ast, *stmt) || references_arguments(ast, *stmt) {
                continue;
            }
            candidates.push((*stmt, name.to_string()));
        }
        if candidates.is_empty() {
            return candidates;
        }

        // Reassignment / redeclaration analysis over the whole context.
        let names: Vec<String> = candidates.iter().map(|(_, n)| n.clone()).collect();
        let mut defined = vec![0usize; names.len()];
        let mut modified = vec![false; names.len()];
        scan(ast, ctx, Descend::All, &mut |ast, id, ancestors| {
            if let NodeKind::Identifier { name } = ast.kind(id) {
                if let Some(pos) = names.iter().position(|n| n == name) {
                    match classify(ast, id, ancestors) {
                        IdentUsage::Defined => defined[pos] += 1,
                        IdentUsage::Modified => modified[pos] = true,
                        _ => {}
                    }
                }
            }
            true
        });
        candidates
            .into_iter()
            .enumerate()
            .filter(|(i, _)| defined[*i] == 1 && !modified[*i])
            .map(|(_, c)| c)
            .collect()
    }

    /// Every rewritable reference to a collected name in the context. A
    /// reference under an `await` expression cannot be rewritten; it poisons
    /// its name so the declaration is kept.
    fn collect_sites(ast: &Ast, ctx: NodeId, names: &[String]) -> (Vec<Site>, Vec<String>) {
        let mut sites = Vec::new();
        let mut poisoned = Vec::new();
        scan(ast, ctx, Descend::All, &mut |ast, id, ancestors| {
            if ast.annotations(id).dispatcher_skip {
                return false;
            }
            let NodeKind::Identifier { name } = ast.kind(id) else {
                return true;
            };
            if !names.iter().any(|n| n == name) {
                return true;
            }
            if ancestors
                .iter()
                .any(|a| matches!(ast.kind(a), NodeKind::AwaitExpression { .. }))
            {
                if !poisoned.contains(name) {
                    poisoned.push(name.clone());
                }
                return true;
            }
            match classify(ast, id, ancestors) {
                IdentUsage::Referenced => {
                    let parent = ancestors.parent();
                    let call = parent.and_then(|p| match ast.kind(p) {
                        NodeKind::CallExpression { callee, arguments } if *callee == id => {
                            Some((p, arguments.clone()))
                        }
                        _ => None,
                    });
                    match call {
                        Some((call, arguments)) => sites.push(Site::Call {
                            call,
                            name: name.clone(),
                            arguments,
                        }),
                        None => sites.push(Site::Read {
                            ident: id,
                            name: name.clone(),
                        }),
                    }
                }
                // Defined is the declaration itself; Modified never happens
                // for a collected name.
                _ => {}
            }
            true
        });
        (sites, poisoned)
    }

    /// Derives the table entry for one collected function: original
    /// parameters become a destructuring read of the payload, three fresh
    /// parameters are added, and a decoy prologue guards the body.
    fn embed_function(
        ast: &mut Ast,
        f: &Function,
        names: &Names,
        cx: &mut PassContext<'_>,
    ) -> NodeId {
        let a0 = cx.names.placeholder(cx.rng);
        let a1 = cx.names.placeholder(cx.rng);
        let a2 = cx.names.placeholder(cx.rng);

        let mut stmts = Vec::new();
        if !f.params.is_empty() {
            let payload_ref = ast.ident(names.payload.clone());
            stmts.push(ast.var_array_pattern(f.params.clone(), payload_ref));
        }

        let original = match ast.kind(f.body) {
            NodeKind::BlockStatement { body } => body.clone(),
            _ => vec![f.body],
        };
        if cx.rng.random::<f64>() < 0.5 {
            // if (!a0) return <junk>; …body
            let a0_ref = ast.ident(a0.clone());
            let test = ast.unary(UnaryOp::Not, a0_ref);
            let junk = cx.rng.random_range(-9999..9999);
            let junk_lit = ast.int(junk);
            let fake = ast.ret(Some(junk_lit));
            let guard_body = ast.block(vec![fake]);
            stmts.push(ast.if_stmt(test, guard_body, None));
            stmts.extend(original);
        } else {
            // if (a0 || (a1 = a2())) { …body } return a1;
            let a0_ref = ast.ident(a0.clone());
            let a1_ref = ast.ident(a1.clone());
            let a2_ref = ast.ident(a2.clone());
            let call = ast.call(a2_ref, vec![]);
            let assignment = ast.assign(a1_ref, call);
            let test = ast.logical(LogicalOp::Or, a0_ref, assignment);
            let wrapped = ast.block(original);
            stmts.push(ast.if_stmt(test, wrapped, None));
            let a1_out = ast.ident(a1.clone());
            stmts.push(ast.ret(Some(a1_out)));
        }

        let params = vec![ast.ident(a0), ast.ident(a1), ast.ident(a2)];
        let body = ast.block(stmts);
        let expr = ast.func_expr(None, params, body);
        ast.annotations_mut(expr).dispatcher_skip = true;
        expr
    }
}

impl Transform for Dispatcher {
    fn name(&self) -> &'static str {
        "Dispatcher"
    }

    fn priority(&self) -> i32 {
        priority::DISPATCHER
    }

    fn matches(&self, ast: &Ast, node: NodeId, ancestors: &Ancestors<'_>) -> bool {
        matches!(
            ast.kind(node),
            NodeKind::FunctionDeclaration(_) | NodeKind::FunctionExpression(_)
        ) && !ast.annotations(node).dispatcher_skip
            && !ancestors.iter().any(|a| ast.annotations(a).dispatcher_skip)
    }

    fn mutate(
        &mut self,
        ast: &mut Ast,
        node: NodeId,
        _ancestors: &Ancestors<'_>,
        cx: &mut PassContext<'_>,
    ) -> Result<Mutation, TransformError> {
        let f = ast
            .kind(node)
            .as_function()
            .ok_or(TransformError::NullIdentifier)?;
        let ctx_name = f.id.and_then(|id| ast.ident_name(id)).map(str::to_string);
        let body_block = f.body;
        let body = match ast.kind(body_block) {
            NodeKind::BlockStatement { body } => body.clone(),
            _ => return Ok(Mutation::none()),
        };

        if !cx.options.dispatcher.roll(
            cx.rng,
            &DecideContext {
                name: ctx_name.as_deref(),
            },
        ) {
            return Ok(Mutation::none());
        }

        let mut candidates = Self::collect_candidates(ast, node, &body);
        if candidates.is_empty() {
            return Ok(Mutation::none());
        }

        // Rewrite every reference before the declarations are dissolved; a
        // name with an unrewritable reference keeps its declaration.
        let all_names: Vec<String> = candidates.iter().map(|(_, n)| n.clone()).collect();
        let (sites, poisoned) = Self::collect_sites(ast, node, &all_names);
        candidates.retain(|(_, n)| !poisoned.contains(n));
        if candidates.is_empty() {
            return Ok(Mutation::none());
        }
        let sites: Vec<Site> = sites
            .into_iter()
            .filter(|site| {
                let name = match site {
                    Site::Call { name, .. } | Site::Read { name, .. } => name,
                };
                !poisoned.contains(name)
            })
            .collect();

        let names = Self::generate_names(cx)?;
        let mut keys: HashMap<String, String> = HashMap::new();
        for (_, name) in &candidates {
            let key = cx.names.from_spec(
                &cx.options.identifier_generator,
                cx.rng,
                &DecideContext { name: Some(name) },
            )?;
            keys.insert(name.clone(), key);
        }

        let candidate_names: Vec<String> = candidates.iter().map(|(_, n)| n.clone()).collect();
        for site in sites {
            match site {
                Site::Call {
                    call,
                    name,
                    arguments,
                } => {
                    let key = keys[&name].clone();
                    let new_form = cx.rng.random::<f64>() < 0.5;
                    let invocation = if new_form {
                        let d = ast.ident(names.dispatcher.clone());
                        let key_lit = ast.string(key);
                        let undef = ast.undefined();
                        let sentinel = ast.string(names.new_sentinel.clone());
                        let constructed = ast.new_expr(d, vec![key_lit, undef, sentinel]);
                        ast.member(constructed, names.member_key.clone())
                    } else if arguments.is_empty() {
                        let d = ast.ident(names.dispatcher.clone());
                        let key_lit = ast.string(key);
                        let clear = ast.string(names.clear_sentinel.clone());
                        ast.call(d, vec![key_lit, clear])
                    } else {
                        let d = ast.ident(names.dispatcher.clone());
                        let key_lit = ast.string(key);
                        ast.call(d, vec![key_lit])
                    };
                    let kind = if new_form || !arguments.is_empty() {
                        let payload_ref = ast.ident(names.payload.clone());
                        let args_array = ast.array(arguments);
                        let fill = ast.assign(payload_ref, args_array);
                        NodeKind::SequenceExpression {
                            expressions: vec![fill, invocation],
                        }
                    } else {
                        ast.kind(invocation).clone()
                    };
                    ast.replace(call, kind);
                    ast.annotations_mut(call).dispatcher_skip = true;
                }
                Site::Read { ident, name } => {
                    let key = keys[&name].clone();
                    let d = ast.ident(names.dispatcher.clone());
                    let key_lit = ast.string(key);
                    let get = ast.string(names.get_sentinel.clone());
                    let getter = ast.call(d, vec![key_lit, get]);
                    let kind = ast.kind(getter).clone();
                    ast.replace(ident, kind);
                    ast.annotations_mut(ident).dispatcher_skip = true;
                }
            }
        }

        // Build the table and the dispatcher, then swap the body.
        let mut properties = Vec::with_capacity(candidates.len());
        for (stmt, name) in &candidates {
            let func = match ast.kind(*stmt) {
                NodeKind::FunctionDeclaration(f) => f.clone(),
                _ => return Err(TransformError::DeletionFailed(name.clone())),
            };
            let embedded = Self::embed_function(ast, &func, &names, cx);
            properties.push(ast.property(keys[name].clone(), embedded));
        }
        let dispatcher_fn = build_dispatcher(ast, &names, properties, cx);

        let removed: Vec<NodeId> = candidates.iter().map(|(stmt, _)| *stmt).collect();
        let NodeKind::BlockStatement { body } = ast.kind_mut(body_block) else {
            return Err(TransformError::Invariant(
                "dispatcher context body vanished during rewrite".into(),
            ));
        };
        let before = body.len();
        body.retain(|stmt| !removed.contains(stmt));
        if before - body.len() != removed.len() {
            return Err(TransformError::DeletionFailed(
                candidate_names.join(", "),
            ));
        }
        let empty = ast.array(vec![]);
        let payload_decl = ast.var_decl(names.payload.clone(), Some(empty));
        let cache_init = ast.object(vec![]);
        let cache_decl = ast.var_decl(names.cache.clone(), Some(cache_init));
        if let NodeKind::BlockStatement { body } = ast.kind_mut(body_block) {
            body.insert(0, payload_decl);
            body.insert(1, cache_decl);
            body.insert(2, dispatcher_fn);
        }

        debug!(
            "dispatched {} functions through `{}`",
            candidates.len(),
            names.dispatcher
        );
        Ok(Mutation::rewrote())
    }
}

/// `function D(x, y, z) { var M = {…}; … }`
fn build_dispatcher(
    ast: &mut Ast,
    names: &Names,
    properties: Vec<NodeId>,
    cx: &mut PassContext<'_>,
) -> NodeId {
    // The embedded decoy prologues key off the truthiness of this argument:
    // it must stay a non-empty string, or real calls would fall onto the
    // fake-return arm.
    debug_assert!(
        !names.opaque_arg.is_empty(),
        "the opaque call argument must be truthy"
    );
    let x = cx.names.placeholder(cx.rng);
    let y = cx.names.placeholder(cx.rng);
    let z = cx.names.placeholder(cx.rng);
    let table = cx.names.placeholder(cx.rng);
    let result = cx.names.placeholder(cx.rng);

    let mut stmts = Vec::new();

    let table_init = ast.object(properties);
    stmts.push(ast.var_decl(table.clone(), Some(table_init)));

    // if (y === clear) payload = [];
    let y_ref = ast.ident(y.clone());
    let clear_lit = ast.string(names.clear_sentinel.clone());
    let test = ast.binary(BinaryOp::StrictEq, y_ref, clear_lit);
    let payload_ref = ast.ident(names.payload.clone());
    let empty = ast.array(vec![]);
    let reset = ast.assign(payload_ref, empty);
    let reset_stmt = ast.expr_stmt(reset);
    let reset_block = ast.block(vec![reset_stmt]);
    stmts.push(ast.if_stmt(test, reset_block, None));

    // if (y === get) return cache[x] || (cache[x] = function () { … });
    let y_ref = ast.ident(y.clone());
    let get_lit = ast.string(names.get_sentinel.clone());
    let test = ast.binary(BinaryOp::StrictEq, y_ref, get_lit);
    let closure = {
        // payload = Array.prototype.slice.call(arguments);
        let payload_ref = ast.ident(names.payload.clone());
        let arguments_ref = ast.ident("arguments");
        let sliced = ast.slice_call_all(arguments_ref);
        let fill = ast.assign(payload_ref, sliced);
        let fill_stmt = ast.expr_stmt(fill);
        // return M[x].call(this, opaque);
        let table_ref = ast.ident(table.clone());
        let x_ref = ast.ident(x.clone());
        let entry = ast.computed_member(table_ref, x_ref);
        let call_member = ast.member(entry, "call");
        let this = ast.this_expr();
        let opaque = ast.string(names.opaque_arg.clone());
        let invoke = ast.call(call_member, vec![this, opaque]);
        let ret = ast.ret(Some(invoke));
        let body = ast.block(vec![fill_stmt, ret]);
        ast.func_expr(None, vec![], body)
    };
    let cache_ref = ast.ident(names.cache.clone());
    let x_ref = ast.ident(x.clone());
    let cached = ast.computed_member(cache_ref, x_ref);
    let cache_ref2 = ast.ident(names.cache.clone());
    let x_ref2 = ast.ident(x.clone());
    let cache_slot = ast.computed_member(cache_ref2, x_ref2);
    let store = ast.assign(cache_slot, closure);
    let fallback = ast.logical(LogicalOp::Or, cached, store);
    let ret_getter = ast.ret(Some(fallback));
    let getter_block = ast.block(vec![ret_getter]);
    stmts.push(ast.if_stmt(test, getter_block, None));

    // var result = M[x].call(this, opaque);
    let table_ref = ast.ident(table.clone());
    let x_ref = ast.ident(x.clone());
    let entry = ast.computed_member(table_ref, x_ref);
    let call_member = ast.member(entry, "call");
    let this = ast.this_expr();
    let opaque = ast.string(names.opaque_arg.clone());
    let invoke = ast.call(call_member, vec![this, opaque]);
    stmts.push(ast.var_decl(result.clone(), Some(invoke)));

    // if (z === new) return { member: result };
    let z_ref = ast.ident(z.clone());
    let new_lit = ast.string(names.new_sentinel.clone());
    let test = ast.binary(BinaryOp::StrictEq, z_ref, new_lit);
    let result_ref = ast.ident(result.clone());
    let wrapped = ast.property(names.member_key.clone(), result_ref);
    let box_obj = ast.object(vec![wrapped]);
    let ret_new = ast.ret(Some(box_obj));
    let new_block = ast.block(vec![ret_new]);
    stmts.push(ast.if_stmt(test, new_block, None));

    let result_ref = ast.ident(result);
    stmts.push(ast.ret(Some(result_ref)));

    let params = vec![ast.ident(x), ast.ident(y), ast.ident(z)];
    let body = ast.block(stmts);
    let decl = ast.func_decl(names.dispatcher.clone(), params, body);
    ast.annotations_mut(decl).dispatcher_skip = true;
    decl
}
