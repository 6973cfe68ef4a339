// Copyright (c) The crossrun Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by crossrun.

use crate::reporter::events::{CancelReason, ErrorSummary};
use smol_str::SmolStr;
use std::{fmt, time::Duration};
use thiserror::Error;

/// Renders an error and its source chain into a single message.
pub(crate) fn render_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Convenience alias for errors surfaced from user-provided listeners.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A failure produced by a test body, captured verbatim onto the test.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct TestFailure {
    message: String,
}

impl TestFailure {
    /// Creates a new test failure with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The failure message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for TestFailure {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for TestFailure {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_owned(),
        }
    }
}

/// Which suite lifecycle hook an error was raised from.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum LifecycleMethod {
    /// The suite-level `setup` hook.
    Setup,
    /// The per-test `before_each` hook.
    BeforeEach,
    /// The per-test `after_each` hook.
    AfterEach,
    /// The suite-level `teardown` hook.
    Teardown,
}

impl LifecycleMethod {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            LifecycleMethod::Setup => "setup",
            LifecycleMethod::BeforeEach => "beforeEach",
            LifecycleMethod::AfterEach => "afterEach",
            LifecycleMethod::Teardown => "teardown",
        }
    }
}

impl fmt::Display for LifecycleMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The underlying cause of a [`LifecycleError`].
#[derive(Clone, Debug, Error)]
pub enum HookFailure {
    /// The hook returned an error.
    #[error(transparent)]
    Failure(#[from] TestFailure),

    /// The hook did not settle within its timeout.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// The hook was interrupted by cancellation.
    #[error(transparent)]
    Cancelled(#[from] CancelError),
}

/// An error raised from a suite lifecycle hook.
///
/// Carries the related test id when raised from a per-test hook.
#[derive(Clone, Debug, Error)]
pub struct LifecycleError {
    /// The hook that failed.
    pub method: LifecycleMethod,

    /// The id of the test being surrounded, for per-test hooks.
    pub related_test: Option<SmolStr>,

    /// The underlying failure.
    #[source]
    pub source: HookFailure,
}

impl LifecycleError {
    pub(crate) fn new(
        method: LifecycleMethod,
        related_test: Option<SmolStr>,
        source: impl Into<HookFailure>,
    ) -> Self {
        Self {
            method,
            related_test,
            source: source.into(),
        }
    }
}

impl fmt::Display for LifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.related_test {
            Some(test) => write!(f, "{} failed for test `{test}`", self.method),
            None => write!(f, "{} failed", self.method),
        }
    }
}

/// An async test or hook did not settle within its timeout.
#[derive(Clone, Debug, Error)]
#[error("timed out after {timeout:?}")]
pub struct TimeoutError {
    /// The timeout that elapsed.
    pub timeout: Duration,
}

/// An operation was aborted via the cancellation signal.
#[derive(Clone, Debug, Error)]
#[error("cancelled due to {}", .reason.to_static_str())]
pub struct CancelError {
    /// Why the run was cancelled.
    pub reason: CancelReason,
}

/// A protocol violation in a per-session sequence stream: the sequence number
/// is a duplicate of, or older than, one already delivered.
#[derive(Clone, Debug, Error)]
pub struct SequenceError {
    /// The session the message belongs to.
    pub session_id: SmolStr,

    /// The offending sequence number.
    pub sequence: u64,

    /// The most recently delivered or buffered position for the session.
    pub last_delivered: Option<u64>,
}

impl fmt::Display for SequenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.last_delivered {
            Some(last) => write!(
                f,
                "sequence number {} for session {} is not after {} (duplicate or stale message)",
                self.sequence, self.session_id, last,
            ),
            None => write!(
                f,
                "sequence number {} for session {} was already seen (duplicate or stale message)",
                self.sequence, self.session_id,
            ),
        }
    }
}

/// The sequencer shut down before a buffered message's turn arrived.
#[derive(Clone, Debug, Error)]
#[error("sequencer for session {session_id} shut down before sequence {sequence} was delivered")]
pub struct SequencerClosed {
    /// The session the message belonged to.
    pub session_id: SmolStr,

    /// The sequence number left undelivered.
    pub sequence: u64,
}

/// A remote session never reported itself initialized.
#[derive(Clone, Debug, Error)]
#[error("timed out after {timeout:?} waiting for remote session {session_id} to initialize")]
pub struct ConnectTimeoutError {
    /// The session that never initialized.
    pub session_id: SmolStr,

    /// The connect timeout that elapsed.
    pub timeout: Duration,
}

/// A fatal error that settles a whole suite run.
///
/// Test-body failures are not fatal; they are aggregated on the suite tree.
#[derive(Clone, Debug, Error)]
pub enum SuiteError {
    /// A `setup` or `teardown` hook failed (or a nested suite's did).
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// The run was cancelled.
    #[error(transparent)]
    Cancelled(#[from] CancelError),

    /// A remote session never initialized.
    #[error(transparent)]
    ConnectTimeout(#[from] ConnectTimeoutError),

    /// A remote session reported a general fault.
    #[error("remote session {session_id} reported an error: {message}")]
    Remote {
        /// The session that failed.
        session_id: SmolStr,
        /// The remote-provided description.
        message: String,
    },
}

impl SuiteError {
    /// A short name for the error kind, used in serialized error summaries.
    pub fn name(&self) -> &'static str {
        match self {
            SuiteError::Lifecycle(_) => "LifecycleError",
            SuiteError::Cancelled(_) => "CancelError",
            SuiteError::ConnectTimeout(_) => "ConnectTimeoutError",
            SuiteError::Remote { .. } => "RemoteError",
        }
    }

    /// True if this error was produced by cancellation rather than a fault.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            SuiteError::Cancelled(_)
                | SuiteError::Lifecycle(LifecycleError {
                    source: HookFailure::Cancelled(_),
                    ..
                })
        )
    }

    pub(crate) fn to_summary(&self) -> ErrorSummary {
        let related_test = match self {
            SuiteError::Lifecycle(error) => error.related_test.clone(),
            _ => None,
        };
        ErrorSummary::new(self.name(), render_chain(self)).with_related_test(related_test)
    }
}

/// Any error that can settle a single test.
#[derive(Clone, Debug, Error)]
pub enum TestError {
    /// The body returned or raised a failure.
    #[error(transparent)]
    Failure(#[from] TestFailure),

    /// A surrounding `before_each`/`after_each` hook failed.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// The body did not settle within the test's timeout.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// The run was cancelled while the body was in flight.
    #[error(transparent)]
    Cancelled(#[from] CancelError),
}

impl TestError {
    /// A short name for the error kind, used in serialized error summaries.
    pub fn name(&self) -> &'static str {
        match self {
            TestError::Failure(_) => "Error",
            TestError::Lifecycle(_) => "LifecycleError",
            TestError::Timeout(_) => "TimeoutError",
            TestError::Cancelled(_) => "CancelError",
        }
    }

    /// The related test id, when the error came from a per-test hook.
    pub fn related_test(&self) -> Option<&SmolStr> {
        match self {
            TestError::Lifecycle(error) => error.related_test.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn to_summary(&self) -> ErrorSummary {
        ErrorSummary::new(self.name(), render_chain(self))
            .with_related_test(self.related_test().cloned())
    }
}

/// An error decoding or publishing an ingress batch.
#[derive(Debug, Error)]
pub enum IngressError {
    /// The POST body was not a JSON array of strings.
    #[error("malformed batch body")]
    MalformedBody(#[source] serde_json::Error),

    /// One entry of the batch did not decode to a sequenced message.
    #[error("malformed message at batch index {index}")]
    MalformedMessage {
        /// Position of the entry within the batch.
        index: usize,
        /// The decode error.
        #[source]
        source: serde_json::Error,
    },

    /// A message violated the session's sequence protocol.
    #[error(transparent)]
    Sequence(#[from] SequenceError),

    /// The sequencer shut down while the handler was waiting on a receipt.
    #[error(transparent)]
    Closed(#[from] SequencerClosed),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_timeout_message_mentions_waiting_for_remote() {
        let error = ConnectTimeoutError {
            session_id: "abc".into(),
            timeout: Duration::from_millis(10),
        };
        assert!(
            error.to_string().contains("waiting for remote"),
            "unexpected message: {error}"
        );
    }

    #[test]
    fn sequence_error_reports_positions() {
        let error = SequenceError {
            session_id: "abc".into(),
            sequence: 3,
            last_delivered: Some(7),
        };
        let message = error.to_string();
        assert!(message.contains("3") && message.contains("7"), "{message}");
    }
}
