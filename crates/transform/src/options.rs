//! The user-facing option surface.
//!
//! Options deserialize from the camelCase JSON shape embedders pass in;
//! callables can only be supplied programmatically. Validation happens once
//! up front for ranges and weight tables; mode names are checked where they
//! are consumed.

use std::collections::HashSet;

use serde::Deserialize;
use umbra_core::seed::Seed;
use umbra_utils::errors::OptionsError;

use crate::probability::ProbabilitySpec;

/// Options for the lock feature family. Only the countermeasures hook is
/// relevant to the core: that function must survive extraction passes
/// untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockOptions {
    /// Name of the user's countermeasures function, excluded from
    /// runtime-generated-function extraction.
    pub countermeasures: Option<String>,
}

/// The recognized option surface of the pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    /// Rewrite eligible blocks into dispatch-driven state machines.
    pub control_flow_flattening: ProbabilitySpec,
    /// Replace function declarations with a keyed dispatch table.
    pub dispatcher: ProbabilitySpec,
    /// Hoist inner functions to top level with explicit capture threading.
    pub flatten: ProbabilitySpec,
    /// Recompile eligible functions through the runtime function
    /// constructor. `"all"` enables every var context; `true` only the
    /// program root.
    pub rgf: ProbabilitySpec,
    /// How generated identifiers look.
    pub identifier_generator: ProbabilitySpec,
    /// Names treated as pre-declared globals.
    pub global_variables: HashSet<String>,
    /// Lock feature family.
    pub lock: LockOptions,
    /// Chatty per-pass logging.
    pub verbose: bool,
    /// Attach diagnostic comments to rewritten nodes.
    pub debug_comments: bool,
    /// Seed for the master RNG; a fresh one is generated when absent.
    pub seed: Option<Seed>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            control_flow_flattening: ProbabilitySpec::Off,
            dispatcher: ProbabilitySpec::Off,
            flatten: ProbabilitySpec::Off,
            rgf: ProbabilitySpec::Off,
            identifier_generator: ProbabilitySpec::Mode("randomized".to_string()),
            global_variables: HashSet::new(),
            lock: LockOptions::default(),
            verbose: false,
            debug_comments: false,
            seed: None,
        }
    }
}

impl Options {
    /// Parses and validates options from their JSON shape.
    pub fn from_json(value: serde_json::Value) -> Result<Self, OptionsError> {
        let options: Options = serde_json::from_value(value)?;
        options.validate()?;
        Ok(options)
    }

    /// Checks rates and weight tables. Mode strings are validated at their
    /// point of consumption instead, so the error can name the feature that
    /// read them.
    pub fn validate(&self) -> Result<(), OptionsError> {
        self.control_flow_flattening
            .validate("controlFlowFlattening")?;
        self.dispatcher.validate("dispatcher")?;
        self.flatten.validate("flatten")?;
        self.rgf.validate("rgf")?;
        self.identifier_generator.validate("identifierGenerator")?;
        Ok(())
    }
}
