// Copyright (c) The crossrun Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared helpers for reporter-facing tests.

use crate::{
    errors::ListenerError,
    reporter::events::{RunEvent, RunEventKind},
    reporter::RunReporter,
};
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};

/// An append-only log shared between lifecycle hooks, test bodies and the
/// recording reporter, used to assert interleaving order.
#[derive(Clone, Default)]
pub(crate) struct ObservationLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl ObservationLog {
    pub(crate) fn push(&self, entry: impl Into<String>) {
        self.entries.lock().unwrap().push(entry.into());
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }
}

/// A reporter that records every event it sees.
///
/// Event observations (without ids) are appended to the shared
/// [`ObservationLog`]; labeled names are kept for direct assertions.
#[derive(Default)]
pub(crate) struct RecordingReporter {
    log: ObservationLog,
    events: Mutex<Vec<RunEventKind>>,
}

impl RecordingReporter {
    pub(crate) fn with_log(log: ObservationLog) -> Self {
        Self {
            log,
            events: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn event_names(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(labeled_name)
            .collect()
    }
}

impl RunReporter for RecordingReporter {
    fn report<'a>(&'a self, event: &'a RunEvent) -> BoxFuture<'a, Result<(), ListenerError>> {
        Box::pin(async move {
            self.log.push(short_name(&event.kind));
            self.events.lock().unwrap().push(event.kind.clone());
            Ok(())
        })
    }
}

fn short_name(kind: &RunEventKind) -> &'static str {
    match kind {
        RunEventKind::RunStarted { .. } => "runStart",
        RunEventKind::SuiteStarted { .. } => "suiteStart",
        RunEventKind::SuiteErrored { .. } => "suiteError",
        RunEventKind::SuiteFinished { .. } => "suiteEnd",
        RunEventKind::TestStarted { .. } => "testStart",
        RunEventKind::TestFinished { .. } => "testEnd",
        RunEventKind::RemoteForwarded { .. } => "remoteForwarded",
        RunEventKind::RunBeginCancel { .. } => "runBeginCancel",
        RunEventKind::RunFinished { .. } => "runEnd",
    }
}

fn labeled_name(kind: &RunEventKind) -> String {
    match kind {
        RunEventKind::SuiteStarted { suite } => format!("suiteStart:{}", suite.id),
        RunEventKind::SuiteErrored { suite, .. } => format!("suiteError:{}", suite.id),
        RunEventKind::SuiteFinished { suite } => format!("suiteEnd:{}", suite.id),
        RunEventKind::TestStarted { test } => format!("testStart:{}", test.id),
        RunEventKind::TestFinished { test } => format!("testEnd:{}", test.id),
        RunEventKind::RemoteForwarded { name, .. } => format!("remoteForwarded:{name}"),
        other => short_name(other).to_owned(),
    }
}
