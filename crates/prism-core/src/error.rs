//! Typed error hierarchy for the mapping core.
//!
//! Uses `thiserror` for library-grade errors.  Pipeline code sitting on top
//! of the core is expected to translate these into its own failure states.
//!
//! # Error codes
//!
//! Each variant maps to a stable integer code via [`PrismError::error_code`]
//! so telemetry can group failures without string parsing.

use std::time::Duration;

use crate::types::MemoryType;

/// All errors originating from the memory-mapping core and its backends.
#[derive(Debug, thiserror::Error)]
pub enum PrismError {
    // ── Arguments ────────────────────────────────────────────────────
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Memory type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: MemoryType,
        actual: MemoryType,
    },

    #[error("Handle not found: '{key}'")]
    HandleNotFound { key: String },

    #[error("{0} memory has no host-addressable pointer; map it to CPU first")]
    NotHostAddressable(MemoryType),

    // ── Mapping ──────────────────────────────────────────────────────
    #[error("No mapper available from {from} to {to}")]
    NoMapperAvailable { from: MemoryType, to: MemoryType },

    #[error("Mapper chain broken at link {index}: {detail}")]
    MapperChainBroken { index: usize, detail: String },

    // ── Backend ──────────────────────────────────────────────────────
    #[error("{backend} backend call {call} failed with status {status}")]
    BackendFailure {
        backend: MemoryType,
        call: &'static str,
        status: i32,
    },

    #[error("Timeout after {} ms waiting for {operation}", .timeout.as_millis())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    // ── Contexts ─────────────────────────────────────────────────────
    #[error("Invalid {memory_type} context: {reason}")]
    InvalidContext {
        memory_type: MemoryType,
        reason: String,
    },

    #[error("Cannot create {target} context from {source_type} context: {reason}")]
    IncompatibleContext {
        source_type: MemoryType,
        target: MemoryType,
        reason: String,
    },

    // ── Pools ────────────────────────────────────────────────────────
    #[error(
        "Pool contract violation: cached {memory_type} object for handle {handle:#x} is still referenced ({outstanding} outstanding)"
    )]
    PoolContractViolation {
        memory_type: MemoryType,
        handle: isize,
        outstanding: usize,
    },

    #[error("Pool exhausted: all {capacity} entries are in use")]
    PoolExhausted { capacity: usize },

    // ── Configuration ────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PrismError {
    /// Stable integer error code for structured telemetry.
    ///
    /// Codes are grouped by category:
    /// - 1xx: arguments and handles
    /// - 2xx: mapper resolution
    /// - 3xx: backend calls
    /// - 4xx: contexts
    /// - 5xx: pools
    /// - 6xx: configuration
    pub fn error_code(&self) -> u32 {
        match self {
            Self::InvalidArgument(_) => 100,
            Self::TypeMismatch { .. } => 101,
            Self::HandleNotFound { .. } => 102,
            Self::NotHostAddressable(_) => 103,
            Self::NoMapperAvailable { .. } => 200,
            Self::MapperChainBroken { .. } => 201,
            Self::BackendFailure { .. } => 300,
            Self::Timeout { .. } => 301,
            Self::InvalidContext { .. } => 400,
            Self::IncompatibleContext { .. } => 401,
            Self::PoolContractViolation { .. } => 500,
            Self::PoolExhausted { .. } => 501,
            Self::Config(_) => 600,
            Self::ConfigParse(_) => 601,
            Self::Io(_) => 602,
        }
    }

    /// Whether a caller with a fallback (another format, another pool slot,
    /// a later retry) may reasonably continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::BackendFailure { .. }
                | Self::Timeout { .. }
                | Self::PoolExhausted { .. }
                | Self::PoolContractViolation { .. }
        )
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn handle_not_found(key: &str) -> Self {
        Self::HandleNotFound {
            key: key.to_string(),
        }
    }

    pub fn backend(backend: MemoryType, call: &'static str, status: i32) -> Self {
        Self::BackendFailure {
            backend,
            call,
            status,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, PrismError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_mapper_message_names_both_types() {
        let err = PrismError::NoMapperAvailable {
            from: MemoryType::Cpu,
            to: MemoryType::Other("Fictitious"),
        };
        assert_eq!(err.to_string(), "No mapper available from CPU to Fictitious");
        assert_eq!(err.error_code(), 200);
    }

    #[test]
    fn timeout_is_distinct_from_backend_failure() {
        let timeout = PrismError::Timeout {
            operation: "vaSyncSurface",
            timeout: Duration::from_millis(5),
        };
        let failure = PrismError::backend(MemoryType::Vaapi, "vaSyncSurface", -1);
        assert_ne!(timeout.error_code(), failure.error_code());
        assert!(timeout.to_string().contains("5 ms"));
        assert!(failure.to_string().contains("status -1"));
    }

    #[test]
    fn argument_errors_are_not_recoverable() {
        assert!(!PrismError::invalid("null tensor").is_recoverable());
        assert!(PrismError::PoolExhausted { capacity: 4 }.is_recoverable());
    }
}
