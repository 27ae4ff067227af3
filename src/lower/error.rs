//! Errors surfaced while lowering IR bodies to the target module.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LowerError {
    /// Steps are dispatched through a `u32` selector; the two top values are
    /// reserved as resume sentinels.
    #[error("function `{func}`: {count} steps exceed the dispatch limit of {max}")]
    TooManySteps { func: String, count: usize, max: u32 },

    #[error("function `{func}`: {after} must be followed by a step jump")]
    MissingStepJump { func: String, after: &'static str },

    #[error("function `{func}`: step jump after {after} must not leave the function")]
    JumpLeavesFunction { func: String, after: &'static str },

    #[error("function `{func}`: unexpected `{node}` node during emission")]
    UnexpectedNode { func: String, node: &'static str },

    #[error("function `{func}`: aggregate value cannot live on the value stack")]
    AggregateOnStack { func: String },

    #[error("function `{func}`: cannot take the address of `{var}` in its storage class")]
    UnaddressableVar { func: String, var: String },

    #[error("function `{func}`: return arity mismatch (expected {expected}, got {got})")]
    ReturnArity {
        func: String,
        expected: usize,
        got: usize,
    },

    #[error("export `{func}`: multi-value results are not supported")]
    ExportResultArity { func: String },
}
