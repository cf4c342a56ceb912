//! Shared helpers for the integration tests.

use rand::rngs::StdRng;
use rand::SeedableRng;
use umbra_core::ast::{Ast, NodeId};
use umbra_core::scope::{scan, Descend};
use umbra_transform::name_gen::NamePool;
use umbra_transform::options::Options;
use umbra_transform::{run_pass, PassContext, Transform};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Runs one pass with a seeded RNG and a fresh name pool.
pub fn apply_pass(
    pass: &mut dyn Transform,
    ast: &mut Ast,
    program: NodeId,
    options: &Options,
    seed: u64,
) -> bool {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut names = NamePool::new();
    let mut cx = PassContext {
        options,
        rng: &mut rng,
        names: &mut names,
    };
    run_pass(pass, ast, program, &mut cx).expect("pass must not fail")
}

/// All nodes under `root` satisfying the predicate.
pub fn find_nodes<P>(ast: &Ast, root: NodeId, pred: P) -> Vec<NodeId>
where
    P: Fn(&Ast, NodeId) -> bool,
{
    let mut out = Vec::new();
    scan(ast, root, Descend::All, &mut |ast, id, _| {
        if pred(ast, id) {
            out.push(id);
        }
        true
    });
    out
}

/// Number of nodes under `root` with the given ESTree kind name.
pub fn count_kind(ast: &Ast, root: NodeId, kind: &str) -> usize {
    find_nodes(ast, root, |ast, id| ast.kind(id).name() == kind).len()
}
