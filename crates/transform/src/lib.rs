pub mod control_flow_flattening;
pub mod control_flow_obfuscation;
pub mod dispatcher;
pub mod expression_obfuscation;
pub mod flatten;
pub mod name_gen;
pub mod obfuscator;
pub mod options;
pub mod probability;
pub mod rgf;
pub mod switch_case_obfuscation;

use rand::rngs::StdRng;
use umbra_core::ast::{Ast, NodeId};
use umbra_core::visit::{walk, Ancestors, LeaveFn, Visit};
use umbra_utils::errors::TransformError;

use crate::name_gen::NamePool;
use crate::options::Options;

/// Pass ordering. Small runs early; the nested pipeline spawned for
/// runtime-generated functions re-runs everything strictly greater than
/// [`priority::RGF`].
pub mod priority {
    pub const FLATTEN: i32 = 2;
    pub const RGF: i32 = 3;
    pub const DISPATCHER: i32 = 6;
    pub const EXPRESSION_OBFUSCATION: i32 = 9;
    pub const CONTROL_FLOW_FLATTENING: i32 = 10;
    pub const CONTROL_FLOW_OBFUSCATION: i32 = 11;
    pub const SWITCH_CASE_OBFUSCATION: i32 = 12;
}

/// Shared per-run state a pass mutates through: the user options, the master
/// RNG and the run-wide name pool. All owned by the pipeline driver.
pub struct PassContext<'a> {
    pub options: &'a Options,
    pub rng: &'a mut StdRng,
    pub names: &'a mut NamePool,
}

/// What a single `mutate` invocation did.
pub struct Mutation {
    /// Whether the tree was rewritten.
    pub changed: bool,
    /// Optional callback to run when the walk leaves this subtree.
    pub on_leave: Option<LeaveFn>,
}

impl Mutation {
    /// The site was ineligible; nothing happened.
    pub fn none() -> Self {
        Self {
            changed: false,
            on_leave: None,
        }
    }

    /// The site was rewritten.
    pub fn rewrote() -> Self {
        Self {
            changed: true,
            on_leave: None,
        }
    }
}

/// Trait for source obfuscation transforms.
///
/// A pass is driven by [`run_pass`]: its `before` subpasses run first, then
/// the tree is walked invoking `matches`/`mutate`, then its `after`
/// subpasses run. Ineligible sites are skipped silently — returning an error
/// from `mutate` means an internal invariant broke, never "this site did not
/// qualify".
pub trait Transform {
    /// The transform's name for logging and error attribution.
    fn name(&self) -> &'static str;

    /// Pass ordering; see [`priority`].
    fn priority(&self) -> i32;

    /// Subpasses to run before the main walk.
    fn before(&self) -> Vec<Box<dyn Transform>> {
        Vec::new()
    }

    /// Subpasses to run after the main walk.
    fn after(&self) -> Vec<Box<dyn Transform>> {
        Vec::new()
    }

    /// Cheap structural filter invoked for every node.
    fn matches(&self, ast: &Ast, node: NodeId, ancestors: &Ancestors<'_>) -> bool;

    /// Rewrites one matched site.
    fn mutate(
        &mut self,
        ast: &mut Ast,
        node: NodeId,
        ancestors: &Ancestors<'_>,
        cx: &mut PassContext<'_>,
    ) -> Result<Mutation, TransformError>;
}

/// Drives one pass over the tree: before subpasses, the main matched walk,
/// after subpasses. Returns whether anything changed.
pub fn run_pass(
    pass: &mut dyn Transform,
    ast: &mut Ast,
    program: NodeId,
    cx: &mut PassContext<'_>,
) -> Result<bool, TransformError> {
    let mut changed = false;

    for mut sub in pass.before() {
        changed |= run_pass(sub.as_mut(), ast, program, cx)?;
    }

    let mut failure: Option<TransformError> = None;
    walk(ast, program, &mut |ast, node, ancestors| {
        if !pass.matches(ast, node, ancestors) {
            return Visit::Continue;
        }
        match pass.mutate(ast, node, ancestors, cx) {
            Ok(mutation) => {
                if mutation.changed {
                    changed = true;
                    ast.annotations_mut(node).last_transform = Some(pass.name());
                    if cx.options.debug_comments {
                        let note = format!("umbra:{}", pass.name());
                        ast.node_mut(node).leading_comments.push(note);
                    }
                }
                match mutation.on_leave {
                    Some(cb) => Visit::Leave(cb),
                    None => Visit::Continue,
                }
            }
            Err(e) => {
                failure = Some(e);
                Visit::Exit
            }
        }
    });
    if let Some(e) = failure {
        return Err(e);
    }

    for mut sub in pass.after() {
        changed |= run_pass(sub.as_mut(), ast, program, cx)?;
    }

    Ok(changed)
}
