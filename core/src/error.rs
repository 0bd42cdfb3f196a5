use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, UicpErr>;

/// Structural or semantic failure while validating a plan, batch or envelope.
///
/// `code` is one of the stable `E-UICP-04xx` normalization codes.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{code}: {message}")]
pub struct ValidationError {
    pub code: &'static str,
    pub message: String,
    pub detail: Option<String>,
}

impl ValidationError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Pre-apply gate rejection. The code is one of the `E-UICP-04xx` linter
/// codes; `hint` tells the actor how to repair the batch.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{code}: {reason}")]
pub struct LintReject {
    pub code: &'static str,
    pub reason: String,
    pub hint: String,
}

/// Failure raised by one of the adapter modules while applying an envelope.
/// These carry stable string tags rather than numeric codes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    #[error("Adapter.InvalidEnvelope: {0}")]
    InvalidEnvelope(String),

    #[error("Adapter.ValidationFailed: {0}")]
    ValidationFailed(String),

    #[error("Adapter.WindowNotFound: no window with id `{0}`")]
    WindowNotFound(String),

    #[error("Adapter.TargetNotFound: selector `{target}` matched nothing in window `{window}`")]
    TargetNotFound { window: String, target: String },

    #[error("Adapter.DomApplyFailed: {0}")]
    DomApplyFailed(String),

    #[error("Adapter.ComponentNotFound: no component instance `{0}`")]
    ComponentNotFound(String),

    /// The adapter was called before a workspace root was registered. Fatal.
    #[error("Adapter.NoWorkspace: apply_batch called with no workspace root registered")]
    NoWorkspace,
}

#[derive(Error, Debug)]
pub enum UicpErr {
    /// The tool-arg collector exhausted its elapsed budget before the stream
    /// finished.
    #[error("E-UICP-0101: tool collection timed out after {0:?} ({1})")]
    CollectionTimeout(Duration, String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Lint(#[from] LintReject),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// Raised by non-fetch capability wrappers (constructors cannot return a
    /// synthetic response, so they throw). Carries the full block payload.
    #[error("NetGuardBlocked: {}", .0.reason.as_str())]
    GuardBlocked(Box<crate::net::block::BlockPayload>),

    /// Raised by the planner phase once every attempt is exhausted; carries
    /// the last attempt's failure. `run_intent` catches it and degrades to
    /// the actor-only synthetic plan.
    #[error("E-UICP-1200: planner failed: {0}")]
    PlannerFailed(String),

    /// Actor-phase counterpart of [`UicpErr::PlannerFailed`]; caught and
    /// degraded to the safe error-window batch.
    #[error("E-UICP-1201: actor failed: {0}")]
    ActorFailed(String),

    /// One phase attempt ran out its collection budget. Recorded per attempt
    /// in the run's failure log, distinct from the exhausted-phase errors.
    #[error("E-UICP-1202: {phase} phase timed out after {elapsed:?}")]
    PhaseTimeout { phase: &'static str, elapsed: Duration },

    /// The model backend reported a terminal failure on the completion stream
    /// (`done:true` with an error payload).
    #[error("E-UICP-1220: backend error{}: {detail}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Backend {
        status: Option<u16>,
        code: String,
        detail: String,
        retry_after: Option<Duration>,
    },

    /// A streamed chunk failed to decode. Fails the queue and surfaces to the
    /// consumer.
    #[error("E-UICP-1221: stream chunk parse failed: {0}")]
    ChunkParse(String),

    #[error("E-UICP-1222: stream closed before completion: {0}")]
    StreamClosed(String),

    #[error("E-UICP-1223: stream queue gone: {0}")]
    QueueClosed(String),

    /// Unexpected HTTP status from the model backend.
    #[error("unexpected status {0}: {1}")]
    UnexpectedStatus(StatusCode, String),

    /// Retry limit exceeded against the model backend.
    #[error("exceeded retry limit, last status: {0}")]
    RetryLimit(StatusCode),

    // -----------------------------------------------------------------
    // Automatic conversions for common external error types
    // -----------------------------------------------------------------
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl UicpErr {
    /// Stable machine-readable code, where the variant carries one.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            UicpErr::CollectionTimeout(..) => Some("E-UICP-0101"),
            UicpErr::Validation(v) => Some(v.code),
            UicpErr::Lint(l) => Some(l.code),
            UicpErr::PlannerFailed(_) => Some("E-UICP-1200"),
            UicpErr::ActorFailed(_) => Some("E-UICP-1201"),
            UicpErr::PhaseTimeout { .. } => Some("E-UICP-1202"),
            UicpErr::Backend { .. } => Some("E-UICP-1220"),
            UicpErr::ChunkParse(_) => Some("E-UICP-1221"),
            UicpErr::StreamClosed(_) => Some("E-UICP-1222"),
            UicpErr::QueueClosed(_) => Some("E-UICP-1223"),
            _ => None,
        }
    }
}
