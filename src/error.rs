use std::sync::Arc;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "max_size", "params.temperature")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., offending path, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "file_cache", "key_deriver")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the caching engine.
///
/// Errors are `Clone` so that a single failed computation can be handed to every caller
/// that joined it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Invalid configuration or a key/payload that cannot be canonically encoded.
    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    /// Storage medium failure (disk full, permission denied, corrupt record).
    #[error("Cache backend error: {message}{}", format_context(.context))]
    Backend {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    /// Failure raised by a caller-supplied compute operation.
    #[error("Computation failed: {0}")]
    Compute(Arc<dyn std::error::Error + Send + Sync>),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Create a new backend error with structured context
    pub fn backend_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Backend {
            message: msg.into(),
            context,
        }
    }

    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Wrap an arbitrary error raised by a compute operation.
    pub fn compute<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Compute(Arc::new(err))
    }

    /// Wrap a plain message raised by a compute operation.
    pub fn compute_msg(msg: impl Into<String>) -> Self {
        Error::Compute(Arc::new(ComputeMessage(msg.into())))
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration { .. })
    }

    pub fn is_backend(&self) -> bool {
        matches!(self, Error::Backend { .. })
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Backend { context, .. }
            | Error::Runtime { context, .. } => Some(context),
            Error::Compute(_) => None,
        }
    }
}

#[derive(Debug)]
struct ComputeMessage(String);

impl std::fmt::Display for ComputeMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ComputeMessage {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = Error::configuration_with_context(
            "max_size must be positive",
            ErrorContext::new()
                .with_field_path("max_size")
                .with_source("memory_cache"),
        );
        assert_eq!(
            err.to_string(),
            "Configuration error: max_size must be positive (field: max_size, source: memory_cache)"
        );
        assert!(err.is_configuration());
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("max_size")
        );
    }

    #[test]
    fn test_compute_error_clone_shares_source() {
        let err = Error::compute_msg("provider timed out");
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
        assert_eq!(copy.to_string(), "Computation failed: provider timed out");
        assert!(copy.context().is_none());
    }
}
