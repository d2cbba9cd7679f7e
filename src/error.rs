//! Typed error taxonomy: sits alongside the pervasive `anyhow::Result` used
//! at every boundary. `anyhow` erases the concrete type on the way out of a
//! function, which is fine for logging but not for the Executor's retry
//! routing, which needs to branch on *which kind* of failure happened
//! rather than match against a provider's error string. These are the two
//! places in the engine where that distinction is load-bearing; everywhere
//! else a plain `anyhow!` stays a plain `anyhow!`.

use crate::models::BlacklistReason;
use thiserror::Error;

/// Store Facade lookup failure. Boxed into `anyhow::Error` at the
/// call site like everything else `Store` returns, but callers that care
/// (none currently do, but the CLI's `reconcile status` could) can
/// `downcast_ref::<StoreError>()` to tell "not found" apart from "sqlite is
/// unreachable".
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("mapping {0} not found")]
    MappingNotFound(i64),
}

/// The classified shape of a remote-call failure.
/// `Executor::execute` returns this instead of `anyhow::Error` specifically
/// so the match in `handle_failure` is exhaustive and compiler-checked
/// rather than re-parsing an error string a second time.
#[derive(Debug, Error, Clone)]
pub enum RemoteOutcome {
    #[error("rate_limit: {0}")]
    RateLimit(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("fatal ({reason:?}): {message}")]
    Fatal {
        reason: BlacklistReason,
        message: String,
    },
    #[error("quota exhausted")]
    Quota,
}

impl RemoteOutcome {
    pub fn transient(e: anyhow::Error) -> Self {
        RemoteOutcome::Transient(e.to_string())
    }

    /// Case-insensitive substring classification of the remote error text.
    pub fn classify(e: anyhow::Error) -> Self {
        let msg = e.to_string();
        let lower = msg.to_lowercase();
        if lower.contains("429") || lower.contains("rate limit") || lower.contains("too many requests") {
            return RemoteOutcome::RateLimit(msg);
        }
        if lower.contains("404")
            || lower.contains("not found")
            || lower.contains("could not be found")
            || lower.contains("forbidden")
            || lower.contains("unauthorized")
            || lower.contains("invalid")
        {
            let reason = if lower.contains("forbidden") {
                BlacklistReason::Forbidden
            } else if lower.contains("unauthorized") {
                BlacklistReason::Unauthorized
            } else if lower.contains("invalid") {
                BlacklistReason::Invalid
            } else {
                BlacklistReason::NotFound
            };
            return RemoteOutcome::Fatal { reason, message: msg };
        }
        RemoteOutcome::Transient(msg)
    }
}
