// Copyright (c) The crossrun Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::ListenerError,
    reporter::events::{RunEvent, RunEventKind},
    time::stopwatch,
    time::StopwatchStart,
};
use chrono::Local;
use debug_ignore::DebugIgnore;
use futures::future::BoxFuture;
use std::sync::Arc;
use tracing::warn;

/// A listener registered on the run's reporting channel.
pub trait RunReporter: Send + Sync {
    /// Handles one event.
    ///
    /// Listeners are invoked in registration order and all of them are
    /// awaited before the emission completes. A listener error is logged and
    /// does not block the other listeners.
    fn report<'a>(&'a self, event: &'a RunEvent) -> BoxFuture<'a, Result<(), ListenerError>>;
}

/// The channel run events are emitted into.
///
/// The listener list is fixed before the run starts, so emission never takes
/// a lock: concurrent emissions from independently-running root suites are
/// safe, and each carries its own suite/test identity.
#[derive(Debug)]
pub struct EventChannel {
    stopwatch: StopwatchStart,
    listeners: DebugIgnore<Vec<Arc<dyn RunReporter>>>,
}

impl EventChannel {
    /// Creates a new channel. The elapsed field of every event is measured
    /// from this moment.
    pub fn new() -> Self {
        Self {
            stopwatch: stopwatch(),
            listeners: DebugIgnore(Vec::new()),
        }
    }

    /// Registers a reporter. Must be called before the run starts.
    pub fn add_reporter(&mut self, reporter: Arc<dyn RunReporter>) -> &mut Self {
        self.listeners.push(reporter);
        self
    }

    /// Emits one event, awaiting every listener in registration order.
    pub async fn emit(&self, kind: RunEventKind) {
        let snapshot = self.stopwatch.snapshot();
        let event = RunEvent {
            timestamp: Local::now().fixed_offset(),
            elapsed: snapshot.duration,
            kind,
        };
        for listener in self.listeners.iter() {
            if let Err(error) = listener.report(&event).await {
                warn!(%error, "reporter failed to handle event");
            }
        }
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new()
    }
}
