//! Core data models used throughout Tally.
//!
//! Request-scoped types flow through the query pipeline and are discarded
//! once a response is sent. [`IndexVersion`] outlives requests: it describes
//! an immutable snapshot in the versioned store and is shared read-only.

use serde::{Deserialize, Serialize};

/// Verdict produced by the safety gate before any external call is made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyVerdict {
    pub is_rejected: bool,
    /// Human-readable reason; always present when `is_rejected` is true.
    pub reason: Option<String>,
}

impl SafetyVerdict {
    pub fn allow() -> Self {
        Self {
            is_rejected: false,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            is_rejected: true,
            reason: Some(reason.into()),
        }
    }
}

/// One immutable snapshot recorded in the versioned index store.
///
/// Created by maintenance jobs, never mutated, only superseded by a later
/// version of the same `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexVersion {
    /// Index kind (e.g. `"receipts"`).
    pub kind: String,
    /// Timestamp-derived identifier, ordered within a kind.
    pub version_id: String,
    /// Full object key/path inside the store.
    pub storage_key: String,
}

/// A ranked hit returned by the similarity search engine.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    /// Identifier of the underlying record.
    pub source_id: i64,
    /// Similarity score, higher = more similar.
    pub score: f32,
    /// Last-modified timestamp of the record (epoch seconds), used for
    /// tie-breaking.
    pub updated_at: i64,
    /// Short text excerpt of the matched record.
    pub snippet: String,
}

/// One attempt made by the code generation feedback loop.
#[derive(Debug, Clone)]
pub struct CodeAttempt {
    /// 1-based attempt number, never exceeds the configured maximum.
    pub attempt_number: u32,
    pub artifact: String,
    /// `None` when the artifact passed validation.
    pub validation_failure: Option<String>,
}

/// Terminal result of the code generation feedback loop.
///
/// Exhaustion is an expected outcome, not an error: callers branch on the
/// variant instead of catching anything.
#[derive(Debug, Clone)]
pub enum GenerationOutcome {
    Accepted {
        artifact: String,
        attempts: Vec<CodeAttempt>,
    },
    Exhausted {
        attempts: Vec<CodeAttempt>,
        last_feedback: String,
    },
}

/// Outcome of running a generated artifact in the sandbox.
///
/// Exactly one variant is populated; runtime faults of any kind are folded
/// into `Error` rather than propagated.
#[derive(Debug, Clone)]
pub enum ExecutionResult {
    /// Row-shaped output (each row is a JSON object).
    Tabular(Vec<serde_json::Value>),
    /// A single value (number, string, boolean).
    Scalar(serde_json::Value),
    /// A produced file, captured in memory — the artifact never writes
    /// outside the sandbox.
    File { filename: String, bytes: Vec<u8> },
    Error { kind: ExecErrorKind, message: String },
}

/// Classification of sandbox faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecErrorKind {
    /// The artifact raised a Lua error or was structurally invalid.
    Runtime,
    /// The wall-clock deadline or memory quota was exceeded.
    ResourceLimit,
    /// The artifact returned a value outside the result protocol.
    BadShape,
}

impl ExecErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Runtime => "runtime",
            Self::ResourceLimit => "resource_limit",
            Self::BadShape => "bad_shape",
        }
    }
}

/// Final human-readable projection of an execution result, paired with the
/// accepted artifact for auditability.
#[derive(Debug, Clone, Serialize)]
pub struct FormattedAnswer {
    pub query: String,
    /// The accepted artifact that produced the answer.
    pub code: String,
    pub answer: String,
}

/// Pipeline stage identifiers, attached to every stage failure so callers
/// can tell "your query was unsafe" from "our service is down".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validate,
    Safety,
    CacheRefresh,
    Search,
    Generate,
    Execute,
    Format,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Safety => "safety",
            Self::CacheRefresh => "cache_refresh",
            Self::Search => "search",
            Self::Generate => "generate",
            Self::Execute => "execute",
            Self::Format => "format",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of one query through the pipeline.
///
/// Every way a request can end is a variant here; nothing in the pipeline
/// signals control flow by panicking or by bubbling an opaque error.
#[derive(Debug)]
pub enum QueryOutcome {
    /// The pipeline produced a textual answer.
    Answered(FormattedAnswer),
    /// The artifact produced a downloadable file.
    FileProduced {
        filename: String,
        bytes: Vec<u8>,
        code: String,
    },
    /// The safety gate rejected the query. Terminal and user-visible.
    Rejected { reason: String },
    /// The generation loop ran out of attempts. An explicit negative
    /// outcome, not a service fault.
    Exhausted { detail: String },
    /// A stage failed (upstream service down, store unreachable, ...).
    Failed { stage: Stage, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_carries_reason() {
        let v = SafetyVerdict::reject("destructive intent");
        assert!(v.is_rejected);
        assert_eq!(v.reason.as_deref(), Some("destructive intent"));
    }

    #[test]
    fn stage_labels_are_stable() {
        assert_eq!(Stage::Safety.as_str(), "safety");
        assert_eq!(Stage::CacheRefresh.to_string(), "cache_refresh");
    }
}
