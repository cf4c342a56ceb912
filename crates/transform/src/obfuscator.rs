//! The pipeline driver.
//!
//! Owns the user options, the master RNG and the run-wide name pool, and
//! runs the enabled passes over the tree in priority order. Pass failures
//! are annotated with the pass name and re-raised; nothing is swallowed.
//! The driver also serves as the factory for the isolated child pipelines
//! the RGF pass spawns.

use rand::rngs::StdRng;
use serde::Serialize;
use tracing::{debug, info};
use umbra_analysis::{collect_metrics, compare};
use umbra_core::ast::{Ast, NodeId};
use umbra_core::seed::Seed;
use umbra_utils::errors::{ObfuscateError, OptionsError};

use crate::control_flow_flattening::ControlFlowFlattening;
use crate::dispatcher::Dispatcher;
use crate::flatten::Flatten;
use crate::name_gen::NamePool;
use crate::options::Options;
use crate::rgf::Rgf;
use crate::{run_pass, PassContext, Transform};

/// What one pass did to the tree.
#[derive(Debug, Clone, Serialize)]
pub struct PassOutcome {
    /// The pass name.
    pub name: String,
    /// Whether the pass rewrote anything.
    pub changed: bool,
    /// Potency delta against the pre-pass tree (0 when unchanged).
    pub potency_delta: f64,
}

/// Result of an obfuscation run.
#[derive(Debug, Clone, Serialize)]
pub struct ObfuscationSummary {
    /// Names of the passes that ran, in execution order.
    pub passes_applied: Vec<String>,
    /// Per-pass outcomes.
    pub outcomes: Vec<PassOutcome>,
    /// Node count before the first pass.
    pub node_count_before: usize,
    /// Node count after the last pass.
    pub node_count_after: usize,
}

/// The obfuscation pipeline: options, master RNG, name pool, pass order.
pub struct Obfuscator {
    options: Options,
    rng: StdRng,
    names: NamePool,
}

impl Obfuscator {
    /// Validates the options and seeds the master RNG. A run with the same
    /// seed and options produces the same output tree.
    pub fn new(options: Options) -> Result<Self, OptionsError> {
        options.validate()?;
        let seed = options.seed.clone().unwrap_or_else(Seed::generate);
        let rng = seed.create_deterministic_rng();
        Ok(Self {
            options,
            rng,
            names: NamePool::new(),
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// The enabled passes, sorted by priority (small runs early).
    fn build_passes(&self, min_priority_exclusive: Option<i32>) -> Vec<Box<dyn Transform>> {
        let mut passes: Vec<Box<dyn Transform>> = Vec::new();
        if self.options.flatten.is_enabled() {
            passes.push(Box::new(Flatten));
        }
        if self.options.rgf.is_enabled() {
            passes.push(Box::new(Rgf));
        }
        if self.options.dispatcher.is_enabled() {
            passes.push(Box::new(Dispatcher));
        }
        if self.options.control_flow_flattening.is_enabled() {
            passes.push(Box::new(ControlFlowFlattening));
        }
        if let Some(min) = min_priority_exclusive {
            passes.retain(|p| p.priority() > min);
        }
        passes.sort_by_key(|p| p.priority());
        passes
    }

    /// Runs every enabled pass over the tree.
    pub fn apply(
        &mut self,
        ast: &mut Ast,
        program: NodeId,
    ) -> Result<ObfuscationSummary, ObfuscateError> {
        self.run(ast, program, None)
    }

    /// Runs only the passes ordered strictly after the given priority. The
    /// RGF pass uses this to re-obfuscate its synthetic programs without
    /// re-entering itself or anything that ran before it.
    pub(crate) fn apply_above_priority(
        &mut self,
        ast: &mut Ast,
        program: NodeId,
        min_priority_exclusive: i32,
    ) -> Result<ObfuscationSummary, ObfuscateError> {
        self.run(ast, program, Some(min_priority_exclusive))
    }

    fn run(
        &mut self,
        ast: &mut Ast,
        program: NodeId,
        min_priority_exclusive: Option<i32>,
    ) -> Result<ObfuscationSummary, ObfuscateError> {
        let mut passes = self.build_passes(min_priority_exclusive);
        let node_count_before = collect_metrics(ast, program)?.node_cnt;

        let mut outcomes = Vec::with_capacity(passes.len());
        for pass in passes.iter_mut() {
            let name = pass.name().to_string();
            let before = collect_metrics(ast, program)?;

            let mut cx = PassContext {
                options: &self.options,
                rng: &mut self.rng,
                names: &mut self.names,
            };
            let changed =
                run_pass(pass.as_mut(), ast, program, &mut cx).map_err(|source| {
                    ObfuscateError::Pass {
                        pass: name.clone(),
                        source,
                    }
                })?;

            let potency_delta = if changed {
                let after = collect_metrics(ast, program)?;
                let delta = compare(&before, &after);
                info!("{:>24} Δ{:+.2}", name, delta);
                delta
            } else {
                if self.options.verbose {
                    info!("{:>24} unchanged", name);
                } else {
                    debug!("{:>24} unchanged", name);
                }
                0.0
            };
            outcomes.push(PassOutcome {
                name,
                changed,
                potency_delta,
            });
        }

        let node_count_after = collect_metrics(ast, program)?.node_cnt;
        Ok(ObfuscationSummary {
            passes_applied: outcomes.iter().map(|o| o.name.clone()).collect(),
            outcomes,
            node_count_before,
            node_count_after,
        })
    }
}
