// Copyright (c) The crossrun Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Events emitted over the reporting channel.

use crate::reporter::{SuiteSummary, TestSummary};
use chrono::{DateTime, FixedOffset};
use newtype_uuid::{TypedUuid, TypedUuidKind, TypedUuidTag};
use smol_str::SmolStr;
use std::time::Duration;

/// UUID kind for a single scheduler run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum RunKind {}

impl TypedUuidKind for RunKind {
    fn tag() -> TypedUuidTag {
        const TAG: TypedUuidTag = TypedUuidTag::new("run");
        TAG
    }
}

/// The unique identifier for a scheduler run.
pub type RunId = TypedUuid<RunKind>;

/// A run event.
///
/// Events are produced by suites and the scheduler, and consumed by
/// reporters registered on the [`EventChannel`](crate::reporter::EventChannel).
#[derive(Clone, Debug)]
pub struct RunEvent {
    /// The time at which the event was generated, including the offset from UTC.
    pub timestamp: DateTime<FixedOffset>,

    /// The amount of time elapsed since the channel (and hence the run) was created.
    pub elapsed: Duration,

    /// The kind of event this is.
    pub kind: RunEventKind,
}

/// The kind of run event this is.
///
/// Forms part of [`RunEvent`].
#[derive(Clone, Debug)]
pub enum RunEventKind {
    /// The run started.
    RunStarted {
        /// The UUID for this run.
        run_id: RunId,

        /// The number of root suites that will be run.
        root_count: usize,

        /// The total number of registered tests across all roots.
        test_count: usize,
    },

    /// A suite began executing.
    SuiteStarted {
        /// The suite that started, serialized at the moment of the event.
        suite: SuiteSummary,
    },

    /// A suite recorded a fatal lifecycle error.
    SuiteErrored {
        /// The suite that failed.
        suite: SuiteSummary,

        /// The fatal error.
        error: ErrorSummary,
    },

    /// A suite finished executing.
    SuiteFinished {
        /// The suite that finished, including its settled children.
        suite: SuiteSummary,
    },

    /// A test began executing.
    TestStarted {
        /// The test that started.
        test: TestSummary,
    },

    /// A test settled, whether passed, failed or skipped.
    TestFinished {
        /// The test that finished.
        test: TestSummary,
    },

    /// An event from a remote session forwarded without interpretation.
    RemoteForwarded {
        /// The session the event arrived from.
        session_id: SmolStr,

        /// The remote event name.
        name: SmolStr,

        /// The raw remote arguments.
        args: Vec<serde_json::Value>,
    },

    /// A cancellation notice was received.
    RunBeginCancel {
        /// The number of root suites still running.
        running: usize,

        /// The reason this run was cancelled.
        reason: CancelReason,
    },

    /// The run finished.
    RunFinished {
        /// The unique ID for this run.
        run_id: RunId,

        /// The time at which the run was started.
        start_time: DateTime<FixedOffset>,

        /// The amount of time it took for the run to complete.
        elapsed: Duration,

        /// Statistics for the run.
        stats: RunStats,
    },
}

/// A serialized error attached to events and summaries.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorSummary {
    /// A short name for the error kind (e.g. `TimeoutError`).
    pub name: SmolStr,

    /// The rendered error message.
    pub message: String,

    /// A stack trace, when the producer (typically a remote session) has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// The id of the related test, for errors raised from per-test hooks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_test: Option<SmolStr>,
}

impl ErrorSummary {
    pub(crate) fn new(name: impl Into<SmolStr>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
            related_test: None,
        }
    }

    pub(crate) fn with_related_test(mut self, related_test: Option<SmolStr>) -> Self {
        self.related_test = related_test;
        self
    }
}

/// Statistics for a run.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RunStats {
    /// The number of root suites the run was started with.
    pub initial_root_count: usize,

    /// The number of root suites that actually began executing.
    pub roots_run: usize,

    /// The total number of tests registered under the roots that ran.
    pub tests: usize,

    /// The number of tests that failed.
    pub failed_tests: usize,

    /// The number of tests that were skipped.
    pub skipped_tests: usize,

    /// The number of root suites that settled with a fatal error.
    pub fatal_suite_errors: usize,
}

impl RunStats {
    /// True if any test failed or any root suite recorded a fatal error.
    pub fn has_failures(&self) -> bool {
        self.failed_tests > 0 || self.fatal_suite_errors > 0
    }
}

// Note: the order here matters -- it indicates severity of cancellation.
/// The reason why a run is being cancelled.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum CancelReason {
    /// An error occurred while reporting results.
    ReportError,

    /// The caller asked for the run to be interrupted.
    Interrupt,
}

impl CancelReason {
    pub(crate) fn to_static_str(self) -> &'static str {
        match self {
            CancelReason::ReportError => "reporting error",
            CancelReason::Interrupt => "interrupt",
        }
    }
}
