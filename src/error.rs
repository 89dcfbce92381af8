//! Error/Result envelope
//!
//! Every tier operation returns a result carrying a value (for Get), an
//! `exist` flag, an optional error, and a [`Strategy`] telling the chain how
//! to proceed on failure. Errors from multiple tiers (or a loader and its
//! release/commit attempt) are joined rather than replaced, so no failure
//! message is silently dropped.

use std::fmt;

/// Closed set of domain error kinds.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    /// The chain was invoked with no tiers configured.
    #[error("no cache tier configured")]
    NoCacheSet,

    /// A malformed or corrupt token string was found in a KV slot.
    #[error("invalid token: {0}")]
    TokenInvalid(String),

    /// The underlying key-value store failed.
    #[error("kv store error: {0}")]
    Kv(String),

    /// The user-supplied loader returned an error.
    #[error("loader error: {0}")]
    Loader(String),

    /// The finder's waiting channel is full.
    #[error("too many requests")]
    TooManyRequests,

    /// The retry engine was invoked with an unsupported signature.
    #[error("strategy does not support parameters")]
    StrategyUnsupported,

    /// Multiple errors accumulated across tiers or across a loader/commit
    /// pair, preserving every message.
    #[error("{0}")]
    Joined(JoinedError),
}

impl CacheError {
    /// Combine two errors into a [`CacheError::Joined`], flattening nested
    /// joins so messages never nest more than one level deep.
    pub fn join(a: CacheError, b: CacheError) -> CacheError {
        let mut messages = Vec::new();
        flatten_into(a, &mut messages);
        flatten_into(b, &mut messages);
        CacheError::Joined(JoinedError(messages))
    }

    /// Combine an optional prior error with a new one.
    pub fn join_opt(a: Option<CacheError>, b: CacheError) -> CacheError {
        match a {
            Some(a) => CacheError::join(a, b),
            None => b,
        }
    }
}

fn flatten_into(err: CacheError, out: &mut Vec<String>) {
    match err {
        CacheError::Joined(JoinedError(mut messages)) => out.append(&mut messages),
        other => out.push(other.to_string()),
    }
}

/// A flattened list of error messages, displayed joined by `"; "`.
#[derive(Debug, Clone)]
pub struct JoinedError(pub Vec<String>);

impl fmt::Display for JoinedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("; "))
    }
}

/// Result alias used throughout the crate's domain logic.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Per-operation directive telling the chain how to proceed after a tier
/// reports failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Move on to the next tier.
    Continue,
    /// Reserved for symmetric write paths.
    Rollback,
    /// Invoke the tier's `Retry*` variant before moving on.
    Retry,
    /// Abort the whole chain operation with the accumulated error.
    Break,
}

/// Result of a `Get`-shaped tier operation.
#[derive(Debug, Clone)]
pub struct GetCacheResult {
    pub value: Option<String>,
    pub exist: bool,
    pub error: Option<CacheError>,
    pub strategy: Strategy,
}

impl GetCacheResult {
    pub fn hit(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            exist: true,
            error: None,
            strategy: Strategy::Continue,
        }
    }

    pub fn miss(strategy: Strategy) -> Self {
        Self {
            value: None,
            exist: false,
            error: None,
            strategy,
        }
    }

    pub fn err(error: CacheError, strategy: Strategy) -> Self {
        Self {
            value: None,
            exist: false,
            error: Some(error),
            strategy,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a `Set`-shaped tier operation.
#[derive(Debug, Clone)]
pub struct SetCacheResult {
    pub error: Option<CacheError>,
    pub strategy: Strategy,
}

impl SetCacheResult {
    pub fn ok() -> Self {
        Self {
            error: None,
            strategy: Strategy::Continue,
        }
    }

    pub fn err(error: CacheError, strategy: Strategy) -> Self {
        Self {
            error: Some(error),
            strategy,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a `Clear`-shaped tier operation. Same shape as
/// [`SetCacheResult`]; kept as a distinct type to mirror the three distinct
/// result variants the source interface declares (Get/Set/Clear).
#[derive(Debug, Clone)]
pub struct ClearCacheResult {
    pub error: Option<CacheError>,
    pub strategy: Strategy,
}

impl ClearCacheResult {
    pub fn ok() -> Self {
        Self {
            error: None,
            strategy: Strategy::Continue,
        }
    }

    pub fn err(error: CacheError, strategy: Strategy) -> Self {
        Self {
            error: Some(error),
            strategy,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_flattens_nested_joins() {
        let a = CacheError::Kv("conn reset".into());
        let b = CacheError::Loader("timeout".into());
        let joined = CacheError::join(a, b);
        let c = CacheError::TokenInvalid("bad".into());
        let joined = CacheError::join(joined, c);
        match joined {
            CacheError::Joined(JoinedError(messages)) => {
                assert_eq!(messages.len(), 3);
                assert!(messages[0].contains("conn reset"));
                assert!(messages[2].contains("bad"));
            }
            _ => panic!("expected Joined variant"),
        }
    }

    #[test]
    fn is_success_reflects_error_presence() {
        assert!(GetCacheResult::hit("v").is_success());
        assert!(!GetCacheResult::err(CacheError::NoCacheSet, Strategy::Break).is_success());
    }
}
