// Copyright (c) The crossrun Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cooperative cancellation for a run.
//!
//! A [`CancelSignal`] is created by the scheduler and cloned down into
//! suites, in-flight tests and sequencer subscriptions. Cancellation is
//! requested once with a reason; everything polling the signal observes it
//! and settles with a `CancelError` without waiting for remaining timeouts.

use crate::{errors::CancelError, reporter::events::CancelReason};
use std::sync::{Arc, OnceLock};
use tokio::sync::broadcast;

/// Shared cancellation state for a run.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

#[derive(Debug)]
struct CancelInner {
    reason: OnceLock<CancelReason>,
    sender: broadcast::Sender<CancelReason>,
}

impl CancelSignal {
    /// Creates a new, un-cancelled signal.
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(4);
        Self {
            inner: Arc::new(CancelInner {
                reason: OnceLock::new(),
                sender,
            }),
        }
    }

    /// Requests cancellation. The first reason wins; later calls are no-ops.
    pub fn cancel(&self, reason: CancelReason) {
        if self.inner.reason.set(reason).is_ok() {
            // No receivers is fine: anyone subscribing later re-checks the
            // reason cell first.
            let _ = self.inner.sender.send(reason);
        }
    }

    /// True once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.reason.get().is_some()
    }

    /// The cancellation reason, if one has been requested.
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.reason.get().copied()
    }

    /// The `CancelError` for this signal, if cancellation has been requested.
    pub fn error(&self) -> Option<CancelError> {
        self.reason().map(|reason| CancelError { reason })
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) -> CancelReason {
        if let Some(reason) = self.reason() {
            return reason;
        }
        let mut receiver = self.inner.sender.subscribe();
        // Re-check after subscribing: cancel() may have raced in between.
        if let Some(reason) = self.reason() {
            return reason;
        }
        match receiver.recv().await {
            Ok(reason) => reason,
            // The channel can only lag or close after a send, so the reason
            // cell is guaranteed to be populated here.
            Err(_) => self.reason().expect("cancellation reason must be set"),
        }
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}
