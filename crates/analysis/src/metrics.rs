//! Analytical metrics for evaluating source obfuscation transforms.
//!
//! Implements a minimal set of counters quantifying tree size, control flow
//! complexity and nesting depth, and a composite potency score estimating
//! analyst effort. The pipeline driver collects metrics before and after each
//! pass and logs the delta, which keeps a run's transcript honest about which
//! passes actually did something.

use serde::{Deserialize, Serialize};
use umbra_core::ast::{Ast, NodeId, NodeKind};
use umbra_utils::errors::MetricsError;

/// A set of analytical metrics for a program tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    /// Total number of reachable nodes.
    pub node_cnt: usize,
    /// Number of statement nodes.
    pub stmt_cnt: usize,
    /// Number of function-like nodes.
    pub func_cnt: usize,
    /// Number of branching constructs (if / switch / loops / conditionals).
    pub branch_cnt: usize,
    /// Number of literal nodes.
    pub literal_cnt: usize,
    /// Maximum nesting depth.
    pub max_depth: usize,
    /// Composite potency score (heuristic over size, branching and depth).
    pub potency: f64,
}

/// Collects metrics over the subtree rooted at `program`.
///
/// # Errors
/// Returns [`MetricsError::EmptyAst`] when the arena is empty or the root is
/// not a `Program`.
pub fn collect_metrics(ast: &Ast, program: NodeId) -> Result<Metrics, MetricsError> {
    if ast.is_empty() || !matches!(ast.kind(program), NodeKind::Program { .. }) {
        return Err(MetricsError::EmptyAst);
    }

    let mut m = Metrics {
        node_cnt: 0,
        stmt_cnt: 0,
        func_cnt: 0,
        branch_cnt: 0,
        literal_cnt: 0,
        max_depth: 0,
        potency: 0.0,
    };
    visit(ast, program, 0, &mut m);
    m.potency = score(&m);
    Ok(m)
}

fn visit(ast: &Ast, id: NodeId, depth: usize, m: &mut Metrics) {
    m.node_cnt += 1;
    m.max_depth = m.max_depth.max(depth);
    match ast.kind(id) {
        NodeKind::ExpressionStatement { .. }
        | NodeKind::VariableDeclaration { .. }
        | NodeKind::ReturnStatement { .. }
        | NodeKind::BreakStatement { .. }
        | NodeKind::ContinueStatement { .. }
        | NodeKind::ThrowStatement { .. }
        | NodeKind::EmptyStatement => m.stmt_cnt += 1,
        NodeKind::IfStatement { .. }
        | NodeKind::SwitchStatement { .. }
        | NodeKind::WhileStatement { .. }
        | NodeKind::DoWhileStatement { .. }
        | NodeKind::ForStatement { .. }
        | NodeKind::ConditionalExpression { .. }
        | NodeKind::TryStatement { .. } => {
            m.stmt_cnt += 1;
            m.branch_cnt += 1;
        }
        NodeKind::FunctionDeclaration(_)
        | NodeKind::FunctionExpression(_)
        | NodeKind::ArrowFunctionExpression(_) => m.func_cnt += 1,
        NodeKind::Literal(_) => m.literal_cnt += 1,
        _ => {}
    }
    for child in ast.children_of(id) {
        visit(ast, child, depth + 1, m);
    }
}

/// Composite potency: size and branching dominate, depth is a tiebreaker.
/// Loosely follows Wroblewski's potency framing; weights are tuned for
/// relative comparison, not absolute meaning.
fn score(m: &Metrics) -> f64 {
    let size = (m.node_cnt.max(2) as f64).log2();
    5.0 * size + m.branch_cnt as f64 + 0.5 * m.max_depth as f64
}

/// Compares two metric sets: the potency delta, discounted by raw growth so
/// a pass that merely inflates the tree does not look clever.
pub fn compare(before: &Metrics, after: &Metrics) -> f64 {
    after.potency - before.potency
        - 0.05 * (after.node_cnt as f64 - before.node_cnt as f64).max(0.0)
}
