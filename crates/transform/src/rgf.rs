//! Runtime-generated functions.
//!
//! Eligible functions are compiled to source text by an isolated nested
//! pipeline and reborn at runtime as `new Function(refArray, source)` stubs
//! living in a single reference array. Every use of the original name turns
//! into a lookup through that array, guarded by a signature-key check that
//! tells compiled stubs (which need the array threaded as their first
//! argument) apart from ordinary function values.

use std::collections::HashSet;

use tracing::debug;
use umbra_core::ast::{Ast, BinaryOp, Function, LogicalOp, NodeId, NodeKind};
use umbra_core::codegen;
use umbra_core::scope::{
    classify, collect_usage, declared_names, is_bound, is_reserved, scan, Descend, IdentUsage,
};
use umbra_core::seed::Seed;
use umbra_core::visit::Ancestors;
use umbra_utils::errors::TransformError;

use crate::obfuscator::Obfuscator;
use crate::probability::{DecideContext, ProbabilitySpec};
use crate::{priority, Mutation, PassContext, Transform};

pub struct Rgf;

/// One collected function: the statement to dissolve, its binding name, and
/// its function payload.
struct Candidate {
    stmt: NodeId,
    name: String,
    func: Function,
    references: HashSet<String>,
}

impl Rgf {
    fn collect_candidates(
        ast: &Ast,
        body: &[NodeId],
        program_names: &HashSet<String>,
        candidate_names_hint: &HashSet<String>,
        cx: &mut PassContext<'_>,
    ) -> Vec<Candidate> {
        let mut out = Vec::new();
        for stmt in body {
            let (name, func, fn_node) = match ast.kind(*stmt) {
                NodeKind::FunctionDeclaration(f) => {
                    let Some(name) = f.id.and_then(|id| ast.ident_name(id)) else {
                        continue;
                    };
                    (name.to_string(), f.clone(), *stmt)
                }
                NodeKind::VariableDeclaration { declarations, .. } if declarations.len() == 1 => {
                    let NodeKind::VariableDeclarator {
                        id,
                        init: Some(init),
                    } = ast.kind(declarations[0])
                    else {
                        continue;
                    };
                    let Some(name) = ast.ident_name(*id) else {
                        continue;
                    };
                    let NodeKind::FunctionExpression(f) = ast.kind(*init) else {
                        continue;
                    };
                    (name.to_string(), f.clone(), *init)
                }
                _ => continue,
            };
            if func.is_async || func.is_generator {
                continue;
            }
            if ast.annotations(fn_node).requires_eval || ast.annotations(*stmt).requires_eval {
                continue;
            }
            if cx.options.lock.countermeasures.as_deref() == Some(name.as_str()) {
                continue;
            }
            if is_bound(ast, fn_node) {
                continue;
            }
            if !cx.options.rgf.roll(cx.rng, &DecideContext { name: Some(&name) }) {
                continue;
            }

            // Free names that will not resolve from inside the compiled
            // stub: everything except configured globals, program-level
            // bindings that remain, and other candidates (those are handled
            // by the fixed point and the reference array).
            let references: HashSet<String> = collect_usage(ast, fn_node)
                .free()
                .into_iter()
                .filter(|n| !is_reserved(n))
                .filter(|n| !cx.options.global_variables.contains(n))
                .filter(|n| candidate_names_hint.contains(n) || !program_names.contains(n))
                .collect();
            out.push(Candidate {
                stmt: *stmt,
                name,
                func,
                references,
            });
        }
        out
    }

    /// The fixed-point name resolution of the collection phase: a candidate
    /// with no outstanding references erases its own name from every other
    /// candidate's reference set. Bounded by `2·|candidates|` rounds.
    fn resolve_queue(candidates: &mut Vec<Candidate>) {
        let rounds = 2 * candidates.len();
        for _ in 0..rounds {
            let resolved: Vec<String> = candidates
                .iter()
                .filter(|c| c.references.is_empty())
                .map(|c| c.name.clone())
                .collect();
            let mut progress = false;
            for candidate in candidates.iter_mut() {
                for name in &resolved {
                    if *name != candidate.name && candidate.references.remove(name) {
                        progress = true;
                    }
                }
            }
            if !progress {
                break;
            }
        }
        candidates.retain(|c| c.references.is_empty());
    }

    /// `typeof R[i] === "function" && R[i][sig] ? <wrapper> : R[i]`
    ///
    /// The wrapper threads the reference array as the stub's first argument:
    /// `function () { return R[i].apply(this, [R].concat(…arguments)); }`.
    fn reference_expression(ast: &mut Ast, r_name: &str, index: usize, sig: &str) -> NodeId {
        let entry = |ast: &mut Ast| {
            let r = ast.ident(r_name);
            let i = ast.int(index as i64);
            ast.computed_member(r, i)
        };

        let typeof_entry = {
            let e = entry(ast);
            ast.typeof_expr(e)
        };
        let function_str = ast.string("function");
        let is_function = ast.binary(BinaryOp::StrictEq, typeof_entry, function_str);
        let tagged = {
            let e = entry(ast);
            let sig_lit = ast.string(sig);
            ast.computed_member(e, sig_lit)
        };
        let test = ast.logical(LogicalOp::And, is_function, tagged);

        let wrapper = {
            let e = entry(ast);
            let apply = ast.member(e, "apply");
            let this = ast.this_expr();
            let r = ast.ident(r_name);
            let seed_array = ast.array(vec![r]);
            let concat = ast.member(seed_array, "concat");
            let arguments_ref = ast.ident("arguments");
            let rest = ast.slice_call_all(arguments_ref);
            let all_args = ast.call(concat, vec![rest]);
            let invoke = ast.call(apply, vec![this, all_args]);
            let ret = ast.ret(Some(invoke));
            let body = ast.block(vec![ret]);
            ast.func_expr(None, vec![], body)
        };
        let plain = entry(ast);
        ast.cond(test, wrapper, plain)
    }

    /// Replaces every read of `name` in the context with the reference
    /// expression. Binding positions are left alone (the declarations are
    /// dissolved separately).
    fn replace_references(
        ast: &mut Ast,
        ctx: NodeId,
        name: &str,
        r_name: &str,
        index: usize,
        sig: &str,
    ) {
        let mut reads = Vec::new();
        scan(ast, ctx, Descend::All, &mut |ast, id, ancestors| {
            if let NodeKind::Identifier { name: n } = ast.kind(id) {
                if n == name && classify(ast, id, ancestors) == IdentUsage::Referenced {
                    reads.push(id);
                }
            }
            true
        });
        for read in reads {
            let replacement = Self::reference_expression(ast, r_name, index, sig);
            let kind = ast.kind(replacement).clone();
            ast.replace(read, kind);
        }
    }

    /// The synthetic program compiled into the stub: the renamed function
    /// followed by `return fn.apply(undefined, Array.prototype.slice.call(arguments, 1));`.
    fn synthetic_program(ast: &mut Ast, func: &Function, inner_name: &str) -> NodeId {
        let id = ast.ident(inner_name);
        let decl = ast.alloc(NodeKind::FunctionDeclaration(Function {
            id: Some(id),
            params: func.params.clone(),
            body: func.body,
            is_async: false,
            is_generator: false,
            expression_body: false,
        }));
        let fn_ref = ast.ident(inner_name);
        let apply = ast.member(fn_ref, "apply");
        let undef = ast.undefined();
        let arguments_ref = ast.ident("arguments");
        let rest = ast.slice_call(arguments_ref, 1);
        let invoke = ast.call(apply, vec![undef, rest]);
        let ret = ast.ret(Some(invoke));
        ast.program(vec![decl, ret])
    }

    /// `R[i] = (function () { var f = new Function(R, src); f[sig] = true; return f; })();`
    fn install_statement(
        ast: &mut Ast,
        r_name: &str,
        index: usize,
        sig: &str,
        source: &str,
        cx: &mut PassContext<'_>,
    ) -> NodeId {
        let f_name = cx.names.placeholder(cx.rng);

        let ctor = ast.ident("Function");
        let param_lit = ast.string(r_name);
        let source_lit = ast.string(source);
        let compiled = ast.new_expr(ctor, vec![param_lit, source_lit]);
        let f_decl = ast.var_decl(f_name.clone(), Some(compiled));

        let f_ref = ast.ident(f_name.clone());
        let sig_lit = ast.string(sig);
        let slot = ast.computed_member(f_ref, sig_lit);
        let truth = ast.bool_lit(true);
        let tag = ast.assign(slot, truth);
        let tag_stmt = ast.expr_stmt(tag);

        let f_ref = ast.ident(f_name);
        let ret = ast.ret(Some(f_ref));

        let body = ast.block(vec![f_decl, tag_stmt, ret]);
        let iife_fn = ast.func_expr(None, vec![], body);
        let iife = ast.call(iife_fn, vec![]);

        let r = ast.ident(r_name);
        let i = ast.int(index as i64);
        let slot = ast.computed_member(r, i);
        let install = ast.assign(slot, iife);
        let stmt = ast.expr_stmt(install);
        ast.annotations_mut(stmt).hidden = true;
        stmt
    }
}

impl Transform for Rgf {
    fn name(&self) -> &'static str {
        "Rgf"
    }

    fn priority(&self) -> i32 {
        priority::RGF
    }

    fn matches(&self, ast: &Ast, node: NodeId, _ancestors: &Ancestors<'_>) -> bool {
        !ast.annotations(node).requires_eval
            && matches!(
                ast.kind(node),
                NodeKind::Program { .. }
                    | NodeKind::FunctionDeclaration(_)
                    | NodeKind::FunctionExpression(_)
            )
    }

    fn mutate(
        &mut self,
        ast: &mut Ast,
        node: NodeId,
        ancestors: &Ancestors<'_>,
        cx: &mut PassContext<'_>,
    ) -> Result<Mutation, TransformError> {
        // `"all"` extends extraction to every var context; every other spec
        // shape stays at the program root.
        let everywhere = matches!(&cx.options.rgf, ProbabilitySpec::Mode(m) if m == "all");
        if !matches!(ast.kind(node), NodeKind::Program { .. }) && !everywhere {
            return Ok(Mutation::none());
        }

        // Context body: program statements or the function body block.
        let body_owner = match ast.kind(node) {
            NodeKind::Program { .. } => node,
            _ => match ast.kind(node).as_function() {
                Some(f) => f.body,
                None => return Ok(Mutation::none()),
            },
        };
        let body = match ast.kind(body_owner) {
            NodeKind::Program { body } | NodeKind::BlockStatement { body } => body.clone(),
            _ => return Ok(Mutation::none()),
        };

        // Program-level bindings stay resolvable from inside a compiled
        // stub (scripts share the global scope); deeper locals do not.
        let program = if matches!(ast.kind(node), NodeKind::Program { .. }) {
            node
        } else {
            match ancestors.root_first().first() {
                Some(&root) if matches!(ast.kind(root), NodeKind::Program { .. }) => root,
                _ => return Ok(Mutation::none()),
            }
        };
        let mut program_names = declared_names(ast, program);
        program_names.extend(cx.options.global_variables.iter().cloned());

        // Names of all direct candidates, so mutual references survive into
        // the fixed point instead of being treated as resolved globals.
        let hint: HashSet<String> = body
            .iter()
            .filter_map(|stmt| match ast.kind(*stmt) {
                NodeKind::FunctionDeclaration(f) => {
                    f.id.and_then(|id| ast.ident_name(id)).map(str::to_string)
                }
                NodeKind::VariableDeclaration { declarations, .. } if declarations.len() == 1 => {
                    match ast.kind(declarations[0]) {
                        NodeKind::VariableDeclarator {
                            id,
                            init: Some(init),
                        } if matches!(ast.kind(*init), NodeKind::FunctionExpression(_)) => {
                            ast.ident_name(*id).map(str::to_string)
                        }
                        _ => None,
                    }
                }
                _ => None,
            })
            .collect();

        let mut candidates = Self::collect_candidates(ast, &body, &program_names, &hint, cx);
        Self::resolve_queue(&mut candidates);

        // A name that is reassigned or redeclared in the context cannot be
        // routed through the array safely.
        candidates.retain(|c| {
            let mut defined = 0usize;
            let mut modified = false;
            scan(ast, node, Descend::All, &mut |ast, id, ancestors| {
                if let NodeKind::Identifier { name } = ast.kind(id) {
                    if name == &c.name {
                        match classify(ast, id, ancestors) {
                            IdentUsage::Defined => defined += 1,
                            IdentUsage::Modified => modified = true,
                            _ => {}
                        }
                    }
                }
                true
            });
            defined == 1 && !modified
        });
        if candidates.is_empty() {
            return Ok(Mutation::none());
        }

        let r_name = cx.names.from_spec(
            &cx.options.identifier_generator,
            cx.rng,
            &DecideContext::default(),
        )?;
        let signatures: Vec<String> = candidates
            .iter()
            .map(|c| {
                cx.names.from_spec(
                    &cx.options.identifier_generator,
                    cx.rng,
                    &DecideContext {
                        name: Some(&c.name),
                    },
                )
            })
            .collect::<Result<_, _>>()?;

        // Route every read through the array before dissolving anything.
        for (index, candidate) in candidates.iter().enumerate() {
            Self::replace_references(ast, node, &candidate.name, &r_name, index, &signatures[index]);
        }

        // Dissolve the collected declarations.
        let removed: Vec<NodeId> = candidates.iter().map(|c| c.stmt).collect();
        let removed_names: Vec<String> = candidates.iter().map(|c| c.name.clone()).collect();
        {
            let body_list = match ast.kind_mut(body_owner) {
                NodeKind::Program { body } | NodeKind::BlockStatement { body } => body,
                _ => {
                    return Err(TransformError::Invariant(
                        "rgf context body vanished during rewrite".into(),
                    ))
                }
            };
            let before = body_list.len();
            body_list.retain(|stmt| !removed.contains(stmt));
            if before - body_list.len() != removed.len() {
                return Err(TransformError::DeletionFailed(removed_names.join(", ")));
            }
        }

        // var R = []; then one install per extracted function.
        let empty = ast.array(vec![]);
        let r_decl = ast.var_decl(r_name.clone(), Some(empty));
        ast.annotations_mut(r_decl).hidden = true;
        match ast.kind_mut(body_owner) {
            NodeKind::Program { body } | NodeKind::BlockStatement { body } => body.insert(0, r_decl),
            _ => unreachable!("checked above"),
        }

        for (index, candidate) in candidates.iter().enumerate() {
            let inner_name = cx.names.from_spec(
                &cx.options.identifier_generator,
                cx.rng,
                &DecideContext::default(),
            )?;
            let synthetic = Self::synthetic_program(ast, &candidate.func, &inner_name);

            // The nested pipeline: same options minus rgf, the reference
            // array pre-declared, fresh RNG and name pool derived from the
            // outer seed stream.
            let mut child_options = cx.options.clone();
            child_options.rgf = ProbabilitySpec::Off;
            child_options.global_variables.insert(r_name.clone());
            child_options.seed = Some(Seed::derive(cx.rng));
            let mut child = Obfuscator::new(child_options)
                .map_err(|e| TransformError::Nested(e.to_string()))?;
            child
                .apply_above_priority(ast, synthetic, priority::RGF)
                .map_err(|e| TransformError::Nested(e.to_string()))?;

            let source = codegen::generate(ast, synthetic)?;
            let install = Self::install_statement(
                ast,
                &r_name,
                index,
                &signatures[index],
                &source,
                cx,
            );
            match ast.kind_mut(body_owner) {
                NodeKind::Program { body } | NodeKind::BlockStatement { body } => {
                    body.insert(1 + index, install)
                }
                _ => unreachable!("checked above"),
            }
        }

        debug!(
            "extracted {} functions into reference array `{}`",
            candidates.len(),
            r_name
        );
        Ok(Mutation::rewrote())
    }
}
