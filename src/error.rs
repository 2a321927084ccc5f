//! Error taxonomy for the graph engine.
//!
//! Every failure that can escape the crate carries a stable `code` (part of
//! the public contract — hosts may branch on it), a human message, and an
//! optional JSON-pointer-style `pointer` locating the offending document
//! fragment. The taxonomy mirrors the phases a document passes through:
//! document loading, IR normalization, graph build, scheduler runtime, and
//! the policy plane. Cancellation and timeout are modeled as distinct
//! variants, not failures, per the design notes on exceptions-as-control-flow.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GraphError>;

/// Top-level error type returned by every public entry point.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Ir(#[from] IrError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("run cancelled")]
    Cancelled,

    #[error("graph execution timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
}

impl GraphError {
    /// Stable error code for the public `ERR_*` contract.
    pub fn code(&self) -> &str {
        match self {
            GraphError::Document(e) => e.code(),
            GraphError::Ir(e) => e.code(),
            GraphError::Build(e) => e.code(),
            GraphError::Runtime(e) => e.code(),
            GraphError::Policy(e) => e.code(),
            GraphError::Cancelled => "ERR_CANCELLED",
            GraphError::Timeout { .. } => "ERR_TIMEOUT",
        }
    }

    pub fn pointer(&self) -> Option<&str> {
        match self {
            GraphError::Document(e) => e.pointer(),
            GraphError::Ir(e) => e.pointer(),
            GraphError::Build(e) => e.pointer(),
            GraphError::Runtime(e) => e.pointer(),
            GraphError::Policy(e) => e.pointer(),
            GraphError::Cancelled | GraphError::Timeout { .. } => None,
        }
    }

    pub fn runtime(code: impl Into<String>, message: impl Into<String>, pointer: impl Into<String>) -> Self {
        GraphError::Runtime(RuntimeError::Generic {
            code: code.into(),
            message: message.into(),
            pointer: pointer.into(),
            status: None,
        })
    }
}

/// Phase 1: structure, schema, uniqueness, and location diagnostics.
#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("[{code}] {message}{}", pointer_suffix(pointer))]
    Generic {
        code: String,
        message: String,
        pointer: String,
    },

    #[error("invalid YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
}

impl DocumentError {
    pub fn code(&self) -> &str {
        match self {
            DocumentError::Generic { code, .. } => code.as_str(),
            DocumentError::Parse(_) => "ERR_YAML_PARSE",
        }
    }

    pub fn pointer(&self) -> Option<&str> {
        match self {
            DocumentError::Generic { pointer, .. } => Some(pointer.as_str()),
            DocumentError::Parse(_) => None,
        }
    }
}

/// Phase 2: IR cross-reference, type, and reachability errors.
#[derive(Debug, Error)]
#[error("[{code}] {message}{}", pointer_suffix(pointer))]
pub struct IrError {
    pub code: String,
    pub message: String,
    pub pointer: String,
}

impl IrError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), pointer: pointer.into() }
    }

    pub fn code(&self) -> &str {
        self.code.as_str()
    }

    pub fn pointer(&self) -> Option<&str> {
        Some(self.pointer.as_str())
    }
}

/// Phase 3: graph-build precondition violations, bound to a node pointer.
#[derive(Debug, Error)]
#[error("[{code}] {message}{}", pointer_suffix(pointer))]
pub struct BuildError {
    pub code: String,
    pub message: String,
    pub pointer: String,
}

impl BuildError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, pointer: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), pointer: pointer.into() }
    }

    pub fn code(&self) -> &str {
        self.code.as_str()
    }

    pub fn pointer(&self) -> Option<&str> {
        Some(self.pointer.as_str())
    }
}

/// Phase 4: failures raised by components or surfaced during scheduling.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("[{code}] {message}{}", pointer_suffix(pointer))]
    Generic {
        code: String,
        message: String,
        pointer: String,
        /// Numeric status code, when the failure originated from an
        /// HTTP-speaking provider/tool; feeds the retry predicate.
        status: Option<u16>,
    },

    #[error("[ERR_NODE_RUNTIME] node '{node_id}' failed: {source}")]
    Node {
        node_id: String,
        #[source]
        source: Box<GraphError>,
    },
}

impl RuntimeError {
    pub fn generic(code: impl Into<String>, message: impl Into<String>, pointer: impl Into<String>) -> Self {
        RuntimeError::Generic {
            code: code.into(),
            message: message.into(),
            pointer: pointer.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        if let RuntimeError::Generic { status: s, .. } = &mut self {
            *s = Some(status);
        }
        self
    }

    pub fn code(&self) -> &str {
        match self {
            RuntimeError::Generic { code, .. } => code.as_str(),
            RuntimeError::Node { .. } => "ERR_NODE_RUNTIME",
        }
    }

    pub fn pointer(&self) -> Option<&str> {
        match self {
            RuntimeError::Generic { pointer, .. } => Some(pointer.as_str()),
            RuntimeError::Node { .. } => None,
        }
    }

    /// Retryability predicate used by the retry engine: a numeric status
    /// in {429} ∪ [500,600), a timeout/connection-reset class, or a
    /// message substring match.
    pub fn is_retryable(&self) -> bool {
        match self {
            RuntimeError::Generic { message, code, status, .. } => {
                if let Some(status) = status {
                    if *status == 429 || (500..600).contains(status) {
                        return true;
                    }
                }
                if code == "ERR_TIMEOUT" || code == "ERR_CONNECTION_RESET" {
                    return true;
                }
                let lower = message.to_lowercase();
                lower.contains("timeout") || lower.contains("temporarily") || lower.contains("retry")
            }
            RuntimeError::Node { source, .. } => matches!(
                source.as_ref(),
                GraphError::Runtime(inner) if inner.is_retryable()
            ),
        }
    }
}

/// Phase 5: permission, cost, rate-limit, and retry-config errors.
#[derive(Debug, Error)]
#[error("[{code}] {message}{}", pointer_suffix(pointer))]
pub struct PolicyError {
    pub code: String,
    pub message: String,
    pub pointer: String,
}

impl PolicyError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), pointer: String::new() }
    }

    pub fn code(&self) -> &str {
        self.code.as_str()
    }

    pub fn pointer(&self) -> Option<&str> {
        if self.pointer.is_empty() { None } else { Some(self.pointer.as_str()) }
    }
}

fn pointer_suffix(pointer: &str) -> String {
    if pointer.is_empty() {
        String::new()
    } else {
        format!(" at {pointer}")
    }
}
