//! Shuffles the case order of ordinary switches.
//!
//! Only switches whose cases all carry distinct literal tests and end in an
//! unlabeled `break` are eligible — for those, match order is unobservable.
//! Switches produced by control flow flattening are recognized by their
//! annotation and left alone; their case order was already randomized and
//! re-shuffling them would only churn the tree.

use rand::seq::SliceRandom;
use tracing::debug;
use umbra_core::ast::{Ast, Literal, NodeId, NodeKind};
use umbra_core::visit::Ancestors;
use umbra_utils::errors::TransformError;

use crate::{priority, Mutation, PassContext, Transform};

pub struct SwitchCaseObfuscation;

impl SwitchCaseObfuscation {
    fn eligible(ast: &Ast, cases: &[NodeId]) -> bool {
        if cases.len() < 2 {
            return false;
        }
        let mut seen: Vec<&Literal> = Vec::with_capacity(cases.len());
        for case in cases {
            let NodeKind::SwitchCase { test, consequent } = ast.kind(*case) else {
                return false;
            };
            let Some(test) = test else {
                // A default clause pins execution order.
                return false;
            };
            let NodeKind::Literal(lit) = ast.kind(*test) else {
                return false;
            };
            if seen.iter().any(|s| **s == *lit) {
                return false;
            }
            seen.push(lit);
            let ends_in_break = consequent.last().is_some_and(|last| {
                matches!(ast.kind(*last), NodeKind::BreakStatement { label: None })
            });
            if consequent.is_empty() || !ends_in_break {
                return false;
            }
        }
        true
    }
}

impl Transform for SwitchCaseObfuscation {
    fn name(&self) -> &'static str {
        "SwitchCaseObfuscation"
    }

    fn priority(&self) -> i32 {
        priority::SWITCH_CASE_OBFUSCATION
    }

    fn matches(&self, ast: &Ast, node: NodeId, _ancestors: &Ancestors<'_>) -> bool {
        matches!(ast.kind(node), NodeKind::SwitchStatement { .. })
            && !ast.annotations(node).control_flow_flattening
    }

    fn mutate(
        &mut self,
        ast: &mut Ast,
        node: NodeId,
        _ancestors: &Ancestors<'_>,
        cx: &mut PassContext<'_>,
    ) -> Result<Mutation, TransformError> {
        let NodeKind::SwitchStatement { cases, .. } = ast.kind(node) else {
            return Ok(Mutation::none());
        };
        let original = cases.clone();
        if !Self::eligible(ast, &original) {
            return Ok(Mutation::none());
        }

        let mut shuffled = original.clone();
        shuffled.shuffle(cx.rng);
        if shuffled == original {
            return Ok(Mutation::none());
        }
        debug!("shuffled {} switch cases", shuffled.len());
        if let NodeKind::SwitchStatement { cases, .. } = ast.kind_mut(node) {
            *cases = shuffled;
        }
        Ok(Mutation::rewrote())
    }
}
