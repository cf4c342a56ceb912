//! Control flow flattening.
//!
//! Rewrites an eligible block into a dispatch-driven state machine: the
//! statements are cut into chunks, each chunk becomes a case of a labeled
//! switch inside a `while` loop, and the case order carries no relation to
//! execution order. The discriminant is the sum of several state variables;
//! every transition re-encodes the whole vector, so no single variable leaks
//! the schedule.
//!
//! Ineligible blocks are skipped silently: flattening is best-effort per
//! site, and a skip is never an error.

mod chunk;
mod state;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;
use umbra_core::ast::{Ast, BinaryOp, NodeId, NodeKind};
use umbra_core::scope::{
    block_body, block_body_mut, classify, contains_lexical_declarations, is_block, scan, Descend,
    IdentUsage,
};
use umbra_core::visit::Ancestors;
use umbra_utils::errors::TransformError;

use crate::control_flow_obfuscation::ControlFlowObfuscation;
use crate::expression_obfuscation::ExpressionObfuscation;
use crate::probability::DecideContext;
use crate::switch_case_obfuscation::SwitchCaseObfuscation;
use crate::{priority, Mutation, PassContext, Transform};

use chunk::{has_naked_jumps, ChunkBuilder};
use state::{assign_states, lower_gotos, obfuscate_literals};

pub struct ControlFlowFlattening;

/// Per-statement chunk-split probability. Decays with block length so large
/// blocks get longer chunks, floored at 0.1 so they still fragment.
fn chunk_fraction(statement_count: usize) -> f64 {
    (0.9 / (statement_count as f64 / 18.0).max(1.0)).clamp(0.1, 0.9)
}

impl ControlFlowFlattening {
    /// A nested body whose outer `if`/loop is being rewritten as part of an
    /// enclosing flattening must not be flattened again on its own.
    fn inside_rewritten_structure(ast: &Ast, ancestors: &Ancestors<'_>) -> bool {
        [1, 2].iter().any(|n| {
            ancestors.nth(*n).is_some_and(|a| {
                matches!(
                    ast.kind(a),
                    NodeKind::IfStatement { .. }
                        | NodeKind::ForStatement { .. }
                        | NodeKind::WhileStatement { .. }
                )
            })
        })
    }

    /// Splits the body into hoistable function declarations and the rest.
    /// Returns `None` when any hoisted name is reassigned or redeclared
    /// anywhere in the block, which would make hoisting observable.
    fn hoist_functions(ast: &Ast, body: &[NodeId]) -> Option<(Vec<NodeId>, Vec<NodeId>)> {
        let mut hoisted = Vec::new();
        let mut names = Vec::new();
        let mut rest = Vec::new();
        for stmt in body {
            match ast.kind(*stmt) {
                NodeKind::FunctionDeclaration(f) => {
                    let name = f.id.and_then(|id| ast.ident_name(id)).map(str::to_string);
                    match name {
                        Some(name) => {
                            hoisted.push(*stmt);
                            names.push(name);
                        }
                        None => rest.push(*stmt),
                    }
                }
                _ => rest.push(*stmt),
            }
        }
        if names.is_empty() {
            return Some((hoisted, rest));
        }

        let mut definition_counts = vec![0usize; names.len()];
        let mut reassigned = false;
        for stmt in body {
            scan(ast, *stmt, Descend::All, &mut |ast, id, ancestors| {
                if reassigned {
                    return false;
                }
                if let NodeKind::Identifier { name } = ast.kind(id) {
                    if let Some(pos) = names.iter().position(|n| n == name) {
                        match classify(ast, id, ancestors) {
                            IdentUsage::Modified => reassigned = true,
                            IdentUsage::Defined => definition_counts[pos] += 1,
                            _ => {}
                        }
                    }
                }
                true
            });
        }
        if reassigned || definition_counts.iter().any(|c| *c > 1) {
            return None;
        }
        Some((hoisted, rest))
    }

    fn sum_of(ast: &mut Ast, names: &[String]) -> NodeId {
        let mut iter = names.iter();
        let first = iter.next().expect("at least two state variables");
        let mut acc = ast.ident(first.clone());
        for name in iter {
            let rhs = ast.ident(name.clone());
            acc = ast.binary(BinaryOp::Add, acc, rhs);
        }
        acc
    }
}

impl Transform for ControlFlowFlattening {
    fn name(&self) -> &'static str {
        "ControlFlowFlattening"
    }

    fn priority(&self) -> i32 {
        priority::CONTROL_FLOW_FLATTENING
    }

    fn before(&self) -> Vec<Box<dyn Transform>> {
        vec![Box::new(ExpressionObfuscation)]
    }

    fn after(&self) -> Vec<Box<dyn Transform>> {
        vec![
            Box::new(ControlFlowObfuscation),
            Box::new(SwitchCaseObfuscation),
        ]
    }

    fn matches(&self, ast: &Ast, node: NodeId, _ancestors: &Ancestors<'_>) -> bool {
        is_block(ast, node) && !ast.annotations(node).control_flow_flattening
    }

    fn mutate(
        &mut self,
        ast: &mut Ast,
        node: NodeId,
        ancestors: &Ancestors<'_>,
        cx: &mut PassContext<'_>,
    ) -> Result<Mutation, TransformError> {
        let Some(body) = block_body(ast, node) else {
            return Ok(Mutation::none());
        };
        let body = body.to_vec();
        if body.len() < 3 {
            return Ok(Mutation::none());
        }
        if Self::inside_rewritten_structure(ast, ancestors) {
            return Ok(Mutation::none());
        }
        if contains_lexical_declarations(ast, node) {
            return Ok(Mutation::none());
        }
        if has_naked_jumps(ast, node) {
            return Ok(Mutation::none());
        }
        if !cx
            .options
            .control_flow_flattening
            .roll(cx.rng, &DecideContext::default())
        {
            return Ok(Mutation::none());
        }
        let Some((hoisted, rest)) = Self::hoist_functions(ast, &body) else {
            debug!("skipping block: hoisted function name is redefined");
            return Ok(Mutation::none());
        };

        // Chunking. From here on the rewrite is committed: jump retargeting
        // mutates the original statements in place.
        let fraction = chunk_fraction(body.len());
        let entry = cx.names.placeholder(cx.rng);
        let mut builder = ChunkBuilder::new(entry, fraction);
        builder.process_statements(ast, cx, &rest)?;
        let end_label = cx.names.placeholder(cx.rng);
        let chunks = builder.finish(ast, &end_label);
        let entry_label = chunks
            .first()
            .map(|c| c.label.clone())
            .ok_or_else(|| TransformError::Invariant("chunking produced no chunks".into()))?;

        // State encoding: k variables whose sum is the discriminant.
        let k = cx.rng.random_range(2..5);
        let mut var_names = Vec::with_capacity(k);
        for _ in 0..k {
            var_names.push(cx.names.from_spec(
                &cx.options.identifier_generator,
                cx.rng,
                &DecideContext::default(),
            )?);
        }
        let enc = assign_states(&chunks, &end_label, var_names, cx);

        // Literal rewriting first: it must see only user expressions, never
        // the transition arithmetic.
        for chunk in &chunks {
            obfuscate_literals(ast, &chunk.label, &chunk.body, &enc, cx)?;
        }

        let dispatch_label = cx.names.from_spec(
            &cx.options.identifier_generator,
            cx.rng,
            &DecideContext::default(),
        )?;
        for chunk in &chunks {
            lower_gotos(ast, &chunk.label, &chunk.body, &enc, &dispatch_label, cx)?;
        }

        // Assembly: shuffled cases in a labeled switch inside the while.
        let mut order: Vec<usize> = (0..chunks.len()).collect();
        order.shuffle(cx.rng);
        let mut cases = Vec::with_capacity(chunks.len());
        for i in order {
            let chunk = &chunks[i];
            let total = *enc
                .totals
                .get(&chunk.label)
                .ok_or_else(|| TransformError::MissingState(chunk.label.clone()))?;
            let test = ast.int(total);
            cases.push(ast.switch_case(Some(test), chunk.body.clone()));
        }
        let discriminant = Self::sum_of(ast, &enc.var_names);
        let switch = ast.switch_stmt(discriminant, cases);
        ast.annotations_mut(switch).control_flow_flattening = true;
        let labeled = ast.labeled(dispatch_label, switch);
        let loop_body = ast.block(vec![labeled]);
        let loop_sum = Self::sum_of(ast, &enc.var_names);
        let end_total = ast.int(enc.end_total);
        let loop_test = ast.binary(BinaryOp::NotEq, loop_sum, end_total);
        let dispatch_loop = ast.while_stmt(loop_test, loop_body);

        let entry_vector = enc.vector(&entry_label)?.to_vec();
        let mut declarators = Vec::with_capacity(enc.var_names.len());
        for (name, value) in enc.var_names.iter().zip(entry_vector) {
            let init = ast.int(value);
            declarators.push(ast.declarator(name.clone(), Some(init)));
        }
        let state_decl = ast.var_decl_multi(declarators);

        let mut new_body = hoisted;
        new_body.push(state_decl);
        new_body.push(dispatch_loop);
        *block_body_mut(ast, node).expect("matched block") = new_body;
        ast.annotations_mut(node).control_flow_flattening = true;

        // The synthetic goto is internal IR; none may survive this pass.
        let mut leaked = false;
        scan(ast, node, Descend::All, &mut |ast, id, _| {
            if matches!(ast.kind(id), NodeKind::Goto { .. }) {
                leaked = true;
                return false;
            }
            !leaked
        });
        if leaked {
            return Err(TransformError::Invariant(
                "a goto statement survived control flow flattening".into(),
            ));
        }

        debug!(
            "flattened block into {} chunks with {} state variables",
            chunks.len(),
            enc.var_names.len()
        );
        Ok(Mutation::rewrote())
    }
}
