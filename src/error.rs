//! Error types for the stackbd satellite engine
//!
//! Provides structured error types for all engine components including
//! external tool adapters, layer implementations, the device processing
//! orchestrator and snapshot shipping.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the satellite engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // External Tool Errors
    // =========================================================================
    #[error("Command '{command}' failed (exit code {exit_code:?}): {stderr}")]
    ToolExecution {
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Command '{command}' timed out after {timeout:?}")]
    ToolTimeout { command: String, timeout: Duration },

    #[error("Unparseable output from '{command}': {reason}")]
    ToolOutputParse { command: String, reason: String },

    // =========================================================================
    // Discovery Errors
    // =========================================================================
    #[error("Discovery query failed: {0}")]
    StorageQuery(String),

    #[error("Storage pool not found: {pool}")]
    PoolNotFound { pool: String },

    // =========================================================================
    // Resource Processing Errors
    // =========================================================================
    #[error("Processing of resource '{resource}' aborted: {reason}")]
    ResourceAbort { resource: String, reason: String },

    #[error("Volume {volume} of resource '{resource}' failed: {reason}")]
    VolumeFailed {
        resource: String,
        volume: u32,
        reason: String,
    },

    #[error("Resource not found: {name}")]
    ResourceNotFound { name: String },

    #[error("Layer node {node_id} not found in tree")]
    NodeNotFound { node_id: usize },

    #[error("Layer kind {kind} has no registered implementation")]
    LayerNotRegistered { kind: String },

    // =========================================================================
    // Snapshot Shipping Errors
    // =========================================================================
    #[error("Shipping group not found: {group}")]
    ShippingGroupNotFound { group: String },

    #[error("Shipping group '{group}' failed: {reason}")]
    ShippingFailed { group: String, reason: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// How an error affects the current processing pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Stop processing the owning resource, mark its volumes failed,
    /// continue with the remaining resources of the batch
    AbortResource,
    /// Leave state as-is; the orchestrator is re-invoked on the next
    /// scheduled pass and will retry then
    RetryNextPass,
    /// Surface as a diagnostic only; no local retry will help
    ReportOnly,
}

impl Error {
    /// Determine how this error affects the current pass
    pub fn disposition(&self) -> ErrorDisposition {
        match self {
            // Tool and query failures abort the owning resource and are
            // retried when the orchestrator runs again
            Error::ToolExecution { .. }
            | Error::ToolTimeout { .. }
            | Error::ToolOutputParse { .. }
            | Error::StorageQuery(_)
            | Error::ResourceAbort { .. }
            | Error::VolumeFailed { .. }
            | Error::ShippingFailed { .. } => ErrorDisposition::AbortResource,

            // Configuration problems need controller-side changes
            Error::Configuration(_)
            | Error::CapacityParse(_)
            | Error::PoolNotFound { .. } => ErrorDisposition::ReportOnly,

            // Transient infrastructure issues
            Error::Io(_) | Error::JsonParse(_) => ErrorDisposition::RetryNextPass,

            _ => ErrorDisposition::RetryNextPass,
        }
    }

    /// Check if this error stops only the owning resource
    pub fn is_resource_scoped(&self) -> bool {
        matches!(self.disposition(), ErrorDisposition::AbortResource)
    }

    /// Convenience constructor for a resource-scoped abort
    pub fn abort(resource: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ResourceAbort {
            resource: resource.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_errors_abort_resource() {
        let err = Error::ToolTimeout {
            command: "lvcreate".into(),
            timeout: Duration::from_secs(30),
        };
        assert_eq!(err.disposition(), ErrorDisposition::AbortResource);
        assert!(err.is_resource_scoped());

        let err = Error::abort("rsc1", "no key");
        assert_eq!(err.disposition(), ErrorDisposition::AbortResource);
    }

    #[test]
    fn test_configuration_errors_report_only() {
        let err = Error::Configuration("volume group not set".into());
        assert_eq!(err.disposition(), ErrorDisposition::ReportOnly);
        assert!(!err.is_resource_scoped());
    }

    #[test]
    fn test_tool_execution_display() {
        let err = Error::ToolExecution {
            command: "zfs create".into(),
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "cannot create: out of space".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("zfs create"));
        assert!(msg.contains("out of space"));
    }
}
