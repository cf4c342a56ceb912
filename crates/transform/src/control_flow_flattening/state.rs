//! State encoding for control flow flattening.
//!
//! Each chunk is identified not by one number but by the sum of `k` state
//! variables; a transition adjusts every component so the sum lands exactly
//! on the successor's total. Because a chunk is only ever entered with its
//! own vector in place, the component values are static knowledge inside the
//! chunk, which is what makes the literal rewriting below sound.

use std::collections::{HashMap, HashSet};

use rand::Rng;
use umbra_core::ast::{Ast, AssignOp, BinaryOp, Literal, NodeId, NodeKind};
use umbra_core::scope::{scan, Descend};
use umbra_utils::errors::TransformError;

use crate::PassContext;

use super::chunk::Chunk;

pub(crate) struct StateEncoding {
    /// The `k` state variable names, in declaration order.
    pub var_names: Vec<String>,
    /// Per-label component vectors; the sum of a vector is the label's total.
    pub vectors: HashMap<String, Vec<i64>>,
    /// Per-label state totals, all distinct.
    pub totals: HashMap<String, i64>,
    /// The total that terminates the dispatch loop.
    pub end_total: i64,
}

impl StateEncoding {
    pub fn vector(&self, label: &str) -> Result<&[i64], TransformError> {
        self.vectors
            .get(label)
            .map(|v| v.as_slice())
            .ok_or_else(|| TransformError::MissingState(label.to_string()))
    }
}

/// Draws distinct totals from `[1, 15·(n+1)]` and a `k ∈ [2, 5)` component
/// vector per label whose entries lie in `[-250, 250]` except for the one
/// index perturbed to make the sum match.
pub(crate) fn assign_states(
    chunks: &[Chunk],
    end_label: &str,
    var_names: Vec<String>,
    cx: &mut PassContext<'_>,
) -> StateEncoding {
    let n = chunks.len() + 1; // chunks plus the end state
    let k = var_names.len();

    let mut totals_pool = HashSet::new();
    while totals_pool.len() < n {
        totals_pool.insert(cx.rng.random_range(1..=15 * n as i64));
    }
    let mut pool: Vec<i64> = totals_pool.into_iter().collect();
    pool.sort_unstable();
    // The draw order must not depend on HashSet iteration.
    use rand::seq::SliceRandom;
    pool.shuffle(cx.rng);

    let mut vectors = HashMap::new();
    let mut totals = HashMap::new();
    let labels = chunks
        .iter()
        .map(|c| c.label.as_str())
        .chain(std::iter::once(end_label));
    for (label, total) in labels.zip(pool.iter().copied()) {
        let mut vector: Vec<i64> = (0..k).map(|_| cx.rng.random_range(-250..=250)).collect();
        let fix = cx.rng.random_range(0..k);
        let partial: i64 = vector
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != fix)
            .map(|(_, v)| v)
            .sum();
        vector[fix] = total - partial;
        vectors.insert(label.to_string(), vector);
        totals.insert(label.to_string(), total);
    }

    let end_total = totals[end_label];
    StateEncoding {
        var_names,
        vectors,
        totals,
        end_total,
    }
}

/// Builds the component-update expressions carrying the machine from one
/// label's vector to another's. Each variable is either nudged by its delta
/// or folded through `v = v*2 - (2·old − target)`, picked at random.
pub(crate) fn transition_expressions(
    ast: &mut Ast,
    enc: &StateEncoding,
    from: &str,
    to: &str,
    cx: &mut PassContext<'_>,
) -> Result<Vec<NodeId>, TransformError> {
    let from_vec = enc.vector(from)?.to_vec();
    let to_vec = enc.vector(to)?.to_vec();
    let mut updates = Vec::with_capacity(enc.var_names.len());
    for (i, name) in enc.var_names.iter().enumerate() {
        let current = from_vec[i];
        let target = to_vec[i];
        let var = ast.ident(name.clone());
        let update = if cx.rng.random::<f64>() < 0.5 {
            let delta = target - current;
            if delta >= 0 {
                let rhs = ast.int(delta);
                ast.assign_op(AssignOp::Add, var, rhs)
            } else {
                let rhs = ast.int(-delta);
                ast.assign_op(AssignOp::Sub, var, rhs)
            }
        } else {
            // v*2 - (2*old - target) == target, given v == old on entry.
            let var_read = ast.ident(name.clone());
            let two = ast.int(2);
            let doubled = ast.binary(BinaryOp::Mul, var_read, two);
            let correction = ast.int(2 * current - target);
            let rhs = ast.binary(BinaryOp::Sub, doubled, correction);
            ast.assign(var, rhs)
        };
        updates.push(update);
    }
    Ok(updates)
}

/// Replaces every synthetic goto in a chunk's body with the transition
/// sequence followed by `break <dispatch label>`.
pub(crate) fn lower_gotos(
    ast: &mut Ast,
    chunk_label: &str,
    body: &[NodeId],
    enc: &StateEncoding,
    dispatch_label: &str,
    cx: &mut PassContext<'_>,
) -> Result<(), TransformError> {
    let mut gotos: Vec<(NodeId, String)> = Vec::new();
    for stmt in body {
        scan(ast, *stmt, Descend::SkipFunctions, &mut |ast, id, _| {
            if let NodeKind::Goto { label } = ast.kind(id) {
                gotos.push((id, label.clone()));
                return false;
            }
            true
        });
    }
    for (goto, target) in gotos {
        let updates = transition_expressions(ast, enc, chunk_label, &target, cx)?;
        let seq = ast.seq(updates);
        let transition = ast.expr_stmt(seq);
        let brk = ast.break_stmt(Some(dispatch_label));
        ast.replace(
            goto,
            NodeKind::BlockStatement {
                body: vec![transition, brk],
            },
        );
    }
    Ok(())
}

/// Rewrites integer literals in a chunk against the chunk's static state
/// snapshot, with decaying probability: either `v + (lit − v_value)` or a
/// comparison whose branch truth is known at build time.
pub(crate) fn obfuscate_literals(
    ast: &mut Ast,
    chunk_label: &str,
    body: &[NodeId],
    enc: &StateEncoding,
    cx: &mut PassContext<'_>,
) -> Result<(), TransformError> {
    let snapshot = enc.vector(chunk_label)?.to_vec();
    let mut literals: Vec<(NodeId, i64)> = Vec::new();
    for stmt in body {
        scan(ast, *stmt, Descend::SkipFunctions, &mut |ast, id, ancestors| {
            if matches!(ast.kind(id), NodeKind::Goto { .. }) {
                return false;
            }
            if let NodeKind::Literal(Literal::Number(n)) = ast.kind(id) {
                // Non-computed property keys are not value positions.
                let key_position = ancestors.parent().is_some_and(|p| {
                    matches!(
                        ast.kind(p),
                        NodeKind::Property { key, computed: false, .. } if *key == id
                    )
                });
                let n = *n;
                if !key_position && n.fract() == 0.0 && n.abs() < 2_147_483_648.0 {
                    literals.push((id, n as i64));
                }
            }
            true
        });
    }

    let mut p = 0.5;
    for (lit, value) in literals {
        if cx.rng.random::<f64>() >= p {
            continue;
        }
        p *= 0.6;
        let i = cx.rng.random_range(0..enc.var_names.len());
        let var_value = snapshot[i];
        let replacement = if cx.rng.random::<f64>() < 0.5 {
            // stateVar + (literal − stateVarValue)
            let var = ast.ident(enc.var_names[i].clone());
            let offset = ast.int(value - var_value);
            ast.binary(BinaryOp::Add, var, offset)
        } else {
            // stateVar < const ? correct : incorrect, with the branch truth
            // computed from the snapshot.
            let threshold = cx.rng.random_range(-250..=250);
            let truthy = var_value < threshold;
            let var = ast.ident(enc.var_names[i].clone());
            let bound = ast.int(threshold);
            let test = ast.binary(BinaryOp::Lt, var, bound);
            let mut wrong = cx.rng.random_range(-1000..=1000);
            if wrong == value {
                wrong += 1;
            }
            let correct = ast.int(value);
            let incorrect = ast.int(wrong);
            if truthy {
                ast.cond(test, correct, incorrect)
            } else {
                ast.cond(test, incorrect, correct)
            }
        };
        let kind = ast.kind(replacement).clone();
        ast.replace(lit, kind);
    }
    Ok(())
}
