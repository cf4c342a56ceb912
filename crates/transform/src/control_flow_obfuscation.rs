//! Rewrites simple `if`/`else` statements into conditional and logical
//! expression statements after a block has been flattened, removing the last
//! obviously-structured branches from the output.

use rand::Rng;
use umbra_core::ast::{Ast, LogicalOp, NodeId, NodeKind};
use umbra_core::visit::Ancestors;
use umbra_utils::errors::TransformError;

use crate::{priority, Mutation, PassContext, Transform};

pub struct ControlFlowObfuscation;

impl ControlFlowObfuscation {
    /// The branch is a single expression statement, possibly wrapped in a
    /// one-statement block.
    fn single_expression(ast: &Ast, stmt: NodeId) -> Option<NodeId> {
        match ast.kind(stmt) {
            NodeKind::ExpressionStatement { expression } => Some(*expression),
            NodeKind::BlockStatement { body } if body.len() == 1 => {
                Self::single_expression(ast, body[0])
            }
            _ => None,
        }
    }
}

impl Transform for ControlFlowObfuscation {
    fn name(&self) -> &'static str {
        "ControlFlowObfuscation"
    }

    fn priority(&self) -> i32 {
        priority::CONTROL_FLOW_OBFUSCATION
    }

    fn matches(&self, ast: &Ast, node: NodeId, _ancestors: &Ancestors<'_>) -> bool {
        matches!(ast.kind(node), NodeKind::IfStatement { .. })
    }

    fn mutate(
        &mut self,
        ast: &mut Ast,
        node: NodeId,
        _ancestors: &Ancestors<'_>,
        cx: &mut PassContext<'_>,
    ) -> Result<Mutation, TransformError> {
        let NodeKind::IfStatement {
            test,
            consequent,
            alternate,
        } = ast.kind(node).clone()
        else {
            return Ok(Mutation::none());
        };

        let Some(cons_expr) = Self::single_expression(ast, consequent) else {
            return Ok(Mutation::none());
        };

        if cx.rng.random::<f64>() >= 0.5 {
            return Ok(Mutation::none());
        }

        let expression = match alternate {
            Some(alt) => {
                let Some(alt_expr) = Self::single_expression(ast, alt) else {
                    return Ok(Mutation::none());
                };
                ast.cond(test, cons_expr, alt_expr)
            }
            None => ast.logical(LogicalOp::And, test, cons_expr),
        };
        ast.replace(node, NodeKind::ExpressionStatement { expression });
        Ok(Mutation::rewrote())
    }
}
