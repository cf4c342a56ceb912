use thiserror::Error;

/// Errors raised while validating or consuming user options.
#[derive(Debug, Error)]
pub enum OptionsError {
    /// The `identifierGenerator` option named a mode the name pool does not know.
    #[error("unknown identifierGenerator mode: `{0}`")]
    UnknownIdentifierGenerator(String),

    /// A numeric probability lies outside `[0, 1]`.
    #[error("probability for `{field}` must lie in [0, 1], got {value}")]
    ProbabilityOutOfRange {
        /// The option field that carried the bad value.
        field: &'static str,
        /// The rejected value.
        value: f64,
    },

    /// A weighted choice table is empty or its weights do not sum to a positive number.
    #[error("weighted choice table for `{field}` is empty or has a non-positive total weight")]
    InvalidWeightTable {
        /// The option field that carried the bad table.
        field: &'static str,
    },

    /// An option value has a shape the resolver does not accept.
    #[error("malformed option `{field}`: {msg}")]
    Malformed {
        /// The offending field.
        field: &'static str,
        /// What was wrong with it.
        msg: String,
    },

    /// Raw option deserialization failed.
    #[error("option deserialization failed: {0}")]
    Deserialize(#[from] serde_json::Error),
}

/// Errors raised by the code generator.
#[derive(Debug, Error)]
pub enum CodegenError {
    /// A synthetic node (e.g. a control-flow-flattening goto) leaked out of its pass.
    #[error("synthetic {0} node reached the code generator")]
    SyntheticNode(&'static str),

    /// A node kind appeared in a position it cannot be printed in.
    #[error("{kind} cannot be printed in {position} position")]
    BadPosition {
        /// The node kind that was encountered.
        kind: &'static str,
        /// The grammatical position it appeared in.
        position: &'static str,
    },
}

/// Error type for metrics computation.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("AST is empty or the root is not a program")]
    EmptyAst,
}

/// Error type for transform operations.
///
/// Recoverable ineligibility (a block with lexical bindings, a duplicate
/// function name) is never an error; transforms skip those sites silently.
/// Everything here is either a user-input problem or an internal invariant
/// violation.
#[derive(Debug, Error)]
pub enum TransformError {
    /// An internal invariant was violated; this is a bug in the pass.
    #[error("internal invariant violated: {0}")]
    Invariant(String),

    /// A chunk label had no state vector assigned to it.
    #[error("missing state entry for chunk label `{0}`")]
    MissingState(String),

    /// An identifier was required where none exists.
    #[error("expected an identifier, found none")]
    NullIdentifier,

    /// A function declaration scheduled for removal was not found in its owner.
    #[error("failed to delete function declaration `{0}` from its owning context")]
    DeletionFailed(String),

    /// Code generation failed while serializing a nested program.
    #[error("code generation failed: {0}")]
    Codegen(#[from] CodegenError),

    /// The isolated pipeline spawned for a runtime-generated function failed.
    #[error("nested pipeline failed: {0}")]
    Nested(String),

    /// An option was rejected at its point of consumption.
    #[error("options error: {0}")]
    Options(#[from] OptionsError),
}

/// Errors that can escape the obfuscation pipeline.
#[derive(Debug, Error)]
pub enum ObfuscateError {
    /// A pass failed; the pass name is attached so the caller can tell who.
    #[error("pass `{pass}` failed: {source}")]
    Pass {
        /// The name of the failing pass.
        pass: String,
        /// The underlying transform error.
        #[source]
        source: TransformError,
    },

    /// Option validation failed before any pass ran.
    #[error("options error: {0}")]
    Options(#[from] OptionsError),

    /// Metrics collection failed.
    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),

    /// Summary serialization failed.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Errors that can occur in the seed system.
#[derive(Debug, Clone, Error)]
pub enum SeedError {
    #[error("invalid seed length: expected 64 hex chars, got {0}")]
    InvalidLength(usize),
    #[error("invalid hexadecimal in seed")]
    InvalidHex,
}
