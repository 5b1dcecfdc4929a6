use std::time::Duration;
use thiserror::Error;

/// A tool provider that could not be brought up at startup. Non-fatal: the
/// provider is skipped and the remaining providers stay usable.
#[derive(Error, Debug)]
#[error("Tool provider '{provider}' unavailable: {reason:#}")]
pub struct ProviderUnavailable {
    pub provider: String,
    #[source]
    pub reason: anyhow::Error,
}

/// Failure of a single turn. The turn is aborted; the registry and other turns
/// are unaffected.
#[derive(Error, Debug)]
pub enum TurnError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Tool '{tool}' failed: {source:#}")]
    ToolInvocation {
        tool: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Tool '{tool}' timed out after {timeout:?}")]
    ToolTimeout { tool: String, timeout: Duration },

    #[error("Model call failed: {0:#}")]
    ModelCall(#[source] anyhow::Error),

    #[error("Model call timed out after {0:?}")]
    ModelTimeout(Duration),

    #[error("Turn exceeded the limit of {limit} tool rounds")]
    TurnLimitExceeded { limit: usize },

    #[error("Model response had {blocks} block(s) but neither a single answer nor a tool call")]
    StalledResponse { blocks: usize },

    #[error("Turn cancelled")]
    Cancelled,
}

pub type TurnResult<T> = Result<T, TurnError>;
