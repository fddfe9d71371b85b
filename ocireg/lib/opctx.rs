use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A deduplicated registry warning, parsed from a `Warning` response header.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Warning {
    /// The warning code (`299` for registry warnings).
    pub code: u16,

    /// The agent field of the header.
    pub agent: String,

    /// The warning text.
    pub text: String,
}

/// Receives warnings surfaced by registry responses. Implementations must be
/// callable from worker tasks.
pub trait WarningSink: Send + Sync {
    /// Delivers one warning. Duplicates are filtered before this is called.
    fn warn(&self, warning: &Warning);
}

/// The context threaded through every operation: cancellation, deadline, and
/// the warning sink with its per-context seen set.
#[derive(Clone)]
pub struct OpCtx {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    sink: Option<Arc<dyn WarningSink>>,
    seen: Arc<Mutex<HashSet<Warning>>>,
}

/// A warning sink that logs through `tracing`, used when the caller does not
/// supply one.
struct TracingWarningSink;

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OpCtx {
    /// Creates a context with no deadline and the tracing warning sink.
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
            sink: None,
            seen: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Returns a copy with the given cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns a copy that fails with `Canceled` after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Returns a copy delivering warnings to `sink`.
    pub fn with_warning_sink(mut self, sink: Arc<dyn WarningSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// The cancellation token of this context.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// True once the context is canceled.
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time remaining until the deadline, when one is set. `Some(ZERO)` means
    /// the deadline has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Delivers a warning unless an identical one was already seen in this
    /// context.
    pub fn warn(&self, warning: Warning) {
        let fresh = self
            .seen
            .lock()
            .expect("warning set lock poisoned")
            .insert(warning.clone());
        if !fresh {
            return;
        }
        match &self.sink {
            Some(sink) => sink.warn(&warning),
            None => TracingWarningSink.warn(&warning),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for OpCtx {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OpCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpCtx")
            .field("canceled", &self.is_canceled())
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl WarningSink for TracingWarningSink {
    fn warn(&self, warning: &Warning) {
        tracing::warn!("registry warning: {}", warning.text);
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses a `Warning` header value (`299 - "text"` form). Returns `None` for
/// headers that do not follow the warning grammar.
pub fn parse_warning_header(value: &str) -> Option<Warning> {
    let mut parts = value.splitn(3, ' ');
    let code: u16 = parts.next()?.parse().ok()?;
    let agent = parts.next()?.to_string();
    let text = parts.next()?.trim().trim_matches('"').to_string();
    Some(Warning { code, agent, text })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
