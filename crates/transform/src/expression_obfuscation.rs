//! Merges runs of consecutive expression statements into single
//! `SequenceExpression` statements.
//!
//! Runs before control flow flattening so a merged run chunks as one unit,
//! which both shortens the dispatch table and hides statement boundaries.

use rand::Rng;
use tracing::debug;
use umbra_core::ast::{Ast, Literal, NodeId, NodeKind};
use umbra_core::scope::{block_body, block_body_mut, is_block};
use umbra_core::visit::Ancestors;
use umbra_utils::errors::TransformError;

use crate::{priority, Mutation, PassContext, Transform};

pub struct ExpressionObfuscation;

impl ExpressionObfuscation {
    /// A leading string-literal expression statement is a directive
    /// (`"use strict"`) and must not be folded into a sequence.
    fn is_directive(ast: &Ast, stmt: NodeId, index: usize) -> bool {
        index == 0
            && matches!(
                ast.kind(stmt),
                NodeKind::ExpressionStatement { expression }
                    if matches!(ast.kind(*expression), NodeKind::Literal(Literal::String(_)))
            )
    }
}

impl Transform for ExpressionObfuscation {
    fn name(&self) -> &'static str {
        "ExpressionObfuscation"
    }

    fn priority(&self) -> i32 {
        priority::EXPRESSION_OBFUSCATION
    }

    fn matches(&self, ast: &Ast, node: NodeId, _ancestors: &Ancestors<'_>) -> bool {
        is_block(ast, node)
    }

    fn mutate(
        &mut self,
        ast: &mut Ast,
        node: NodeId,
        _ancestors: &Ancestors<'_>,
        cx: &mut PassContext<'_>,
    ) -> Result<Mutation, TransformError> {
        let body = match block_body(ast, node) {
            Some(b) => b.to_vec(),
            None => return Ok(Mutation::none()),
        };

        let mut out: Vec<NodeId> = Vec::with_capacity(body.len());
        let mut run: Vec<NodeId> = Vec::new();
        let mut changed = false;

        let mut flush = |ast: &mut Ast, run: &mut Vec<NodeId>, out: &mut Vec<NodeId>| {
            if run.len() >= 2 && cx.rng.random::<f64>() < 0.5 {
                let expressions: Vec<NodeId> = run
                    .iter()
                    .map(|stmt| match ast.kind(*stmt) {
                        NodeKind::ExpressionStatement { expression } => *expression,
                        _ => unreachable!("run holds expression statements only"),
                    })
                    .collect();
                let seq = ast.seq(expressions);
                out.push(ast.expr_stmt(seq));
                changed = true;
            } else {
                out.append(run);
            }
            run.clear();
        };

        for (index, stmt) in body.iter().enumerate() {
            let mergeable = matches!(ast.kind(*stmt), NodeKind::ExpressionStatement { .. })
                && !Self::is_directive(ast, *stmt, index);
            if mergeable {
                run.push(*stmt);
            } else {
                flush(ast, &mut run, &mut out);
                out.push(*stmt);
            }
        }
        flush(ast, &mut run, &mut out);

        if changed {
            debug!("merged expression runs: {} -> {} statements", body.len(), out.len());
            *block_body_mut(ast, node).expect("matched block") = out;
            Ok(Mutation::rewrote())
        } else {
            Ok(Mutation::none())
        }
    }
}
