// Copyright (c) The crossrun Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-session restoration of strict message ordering.
//!
//! Remote sessions report progress asynchronously over HTTP, so messages can
//! arrive out of order. The [`Sequencer`] buffers messages that arrive ahead
//! of their turn and guarantees that listeners observe every session's
//! messages in strictly increasing, gap-free sequence order, exactly once.

use crate::{
    errors::{ListenerError, SequenceError, SequencerClosed},
    remote::{RemotePayload, SequencedMessage},
};
use futures::future::BoxFuture;
use smol_str::SmolStr;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// A listener for one session's ordered message stream.
pub trait SessionListener: Send + Sync {
    /// Handles one in-order message.
    ///
    /// Listeners are invoked in registration order and all of them are
    /// awaited before the message counts as delivered. A listener error is
    /// logged and does not block the other listeners.
    fn deliver<'a>(
        &'a self,
        message: &'a SequencedMessage,
    ) -> BoxFuture<'a, Result<(), ListenerError>>;
}

/// Restores in-order delivery to out-of-order session messages.
pub struct Sequencer {
    sessions: Mutex<HashMap<SmolStr, Arc<SessionEntry>>>,
}

struct SessionEntry {
    /// Delivery state. The async mutex is held across listener awaits, which
    /// serializes concurrent publishes for the session: there is never more
    /// than one drain of the same buffer.
    state: tokio::sync::Mutex<SessionState>,
    listeners: Mutex<ListenerSet>,
}

struct SessionState {
    last_delivered: Option<u64>,
    buffered: BTreeMap<u64, PendingMessage>,
}

impl SessionState {
    fn next_sequence(&self) -> u64 {
        match self.last_delivered {
            Some(last) => last + 1,
            None => 0,
        }
    }
}

#[derive(Default)]
struct ListenerSet {
    next_id: u64,
    listeners: Vec<(u64, Arc<dyn SessionListener>)>,
}

struct PendingMessage {
    payload: RemotePayload,
    cancelled: Arc<AtomicBool>,
    turn_tx: oneshot::Sender<()>,
}

impl Sequencer {
    /// Creates an empty sequencer.
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, session_id: &SmolStr) -> Arc<SessionEntry> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions
            .entry(session_id.clone())
            .or_insert_with(|| {
                Arc::new(SessionEntry {
                    state: tokio::sync::Mutex::new(SessionState {
                        last_delivered: None,
                        buffered: BTreeMap::new(),
                    }),
                    listeners: Mutex::new(ListenerSet::default()),
                })
            })
            .clone()
    }

    /// Publishes one message into its session's stream.
    ///
    /// A message at the next expected sequence is delivered immediately
    /// (along with any contiguously buffered successors); one that arrives
    /// ahead of turn is buffered. A sequence number at or below the last
    /// delivered position is a protocol violation and fails with a
    /// [`SequenceError`].
    ///
    /// The returned receipt settles once this specific message's turn has
    /// been reached, so an HTTP handler can hold its response open.
    pub async fn publish(
        &self,
        message: SequencedMessage,
    ) -> Result<PublishReceipt, SequenceError> {
        let entry = self.entry(&message.session_id);
        let mut state = entry.state.lock().await;

        let next = state.next_sequence();
        if message.sequence < next || state.buffered.contains_key(&message.sequence) {
            return Err(SequenceError {
                session_id: message.session_id.clone(),
                sequence: message.sequence,
                last_delivered: state.last_delivered,
            });
        }

        if message.sequence == next {
            fan_out(&entry, &message).await;
            state.last_delivered = Some(message.sequence);
            drain(&entry, &mut state, &message.session_id).await;
            Ok(PublishReceipt {
                session_id: message.session_id,
                sequence: message.sequence,
                state: ReceiptState::Delivered,
            })
        } else {
            debug!(
                session_id = %message.session_id,
                sequence = message.sequence,
                expected = next,
                "buffering out-of-order message"
            );
            let (turn_tx, turn_rx) = oneshot::channel();
            let cancelled = Arc::new(AtomicBool::new(false));
            state.buffered.insert(
                message.sequence,
                PendingMessage {
                    payload: message.payload,
                    cancelled: cancelled.clone(),
                    turn_tx,
                },
            );
            Ok(PublishReceipt {
                session_id: message.session_id,
                sequence: message.sequence,
                state: ReceiptState::Pending { turn_rx, cancelled },
            })
        }
    }

    /// Registers a listener for a session's ordered stream. Dropping the
    /// returned subscription unregisters the listener.
    pub fn subscribe(
        &self,
        session_id: impl Into<SmolStr>,
        listener: Arc<dyn SessionListener>,
    ) -> SessionSubscription {
        let session_id = session_id.into();
        let entry = self.entry(&session_id);
        let listener_id = {
            let mut set = entry.listeners.lock().unwrap();
            let listener_id = set.next_id;
            set.next_id += 1;
            set.listeners.push((listener_id, listener));
            listener_id
        };
        SessionSubscription {
            entry,
            session_id,
            listener_id,
        }
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Sequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sessions = self.sessions.lock().unwrap();
        f.debug_struct("Sequencer")
            .field("sessions", &sessions.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Delivers one in-order message to every listener, awaiting each in
/// registration order.
async fn fan_out(entry: &SessionEntry, message: &SequencedMessage) {
    let listeners: Vec<_> = entry
        .listeners
        .lock()
        .unwrap()
        .listeners
        .iter()
        .map(|(_, listener)| listener.clone())
        .collect();
    for listener in listeners {
        if let Err(error) = listener.deliver(message).await {
            warn!(
                session_id = %message.session_id,
                sequence = message.sequence,
                %error,
                "session listener failed to handle message"
            );
        }
    }
}

/// Drains contiguously buffered successors after `last_delivered` advanced.
/// Cancelled messages advance the position without reaching listeners.
async fn drain(entry: &SessionEntry, state: &mut SessionState, session_id: &SmolStr) {
    loop {
        let next = state.next_sequence();
        let Some(pending) = state.buffered.remove(&next) else {
            break;
        };
        state.last_delivered = Some(next);
        if pending.cancelled.load(Ordering::Acquire) {
            debug!(
                session_id = %session_id,
                sequence = next,
                "skipping delivery of cancelled message"
            );
        } else {
            let message = SequencedMessage {
                session_id: session_id.clone(),
                sequence: next,
                payload: pending.payload,
            };
            fan_out(entry, &message).await;
        }
        // The publisher may have stopped waiting; that's fine.
        let _ = pending.turn_tx.send(());
    }
}

/// A receipt for one published message.
#[derive(Debug)]
pub struct PublishReceipt {
    session_id: SmolStr,
    sequence: u64,
    state: ReceiptState,
}

#[derive(Debug)]
enum ReceiptState {
    Delivered,
    Pending {
        turn_rx: oneshot::Receiver<()>,
        cancelled: Arc<AtomicBool>,
    },
}

impl PublishReceipt {
    /// The session the message belongs to.
    pub fn session_id(&self) -> &SmolStr {
        &self.session_id
    }

    /// The message's sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Marks the message cancelled. When its turn comes it still advances
    /// the session's sequence position, but is not handed to listeners.
    /// Has no effect once the message has been delivered.
    pub fn cancel(&self) {
        if let ReceiptState::Pending { cancelled, .. } = &self.state {
            cancelled.store(true, Ordering::Release);
        }
    }

    /// Resolves once this message's delivery turn has been reached.
    pub async fn wait(self) -> Result<(), SequencerClosed> {
        match self.state {
            ReceiptState::Delivered => Ok(()),
            ReceiptState::Pending { turn_rx, .. } => turn_rx.await.map_err(|_| SequencerClosed {
                session_id: self.session_id,
                sequence: self.sequence,
            }),
        }
    }
}

/// Keeps a [`SessionListener`] registered; dropping it unsubscribes.
pub struct SessionSubscription {
    entry: Arc<SessionEntry>,
    session_id: SmolStr,
    listener_id: u64,
}

impl Drop for SessionSubscription {
    fn drop(&mut self) {
        let mut set = self.entry.listeners.lock().unwrap();
        set.listeners.retain(|(id, _)| *id != self.listener_id);
    }
}

impl fmt::Debug for SessionSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSubscription")
            .field("session_id", &self.session_id)
            .field("listener_id", &self.listener_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::RemotePayload;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    /// Records the sequence numbers it observes.
    #[derive(Default)]
    struct OrderRecorder {
        seen: Mutex<Vec<u64>>,
    }

    impl OrderRecorder {
        fn seen(&self) -> Vec<u64> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl SessionListener for OrderRecorder {
        fn deliver<'a>(
            &'a self,
            message: &'a SequencedMessage,
        ) -> BoxFuture<'a, Result<(), ListenerError>> {
            Box::pin(async move {
                self.seen.lock().unwrap().push(message.sequence);
                Ok(())
            })
        }
    }

    fn message(session_id: &str, sequence: u64) -> SequencedMessage {
        SequencedMessage {
            session_id: session_id.into(),
            sequence,
            payload: RemotePayload::new("testEnd", Vec::new()),
        }
    }

    #[test_case(&[2, 0, 1]; "early arrivals buffered")]
    #[test_case(&[1, 2, 0]; "gap filled last")]
    #[test_case(&[0, 1, 2]; "already in order")]
    #[tokio::test]
    async fn delivery_is_in_order_and_exactly_once(publish_order: &[u64]) {
        let sequencer = Sequencer::new();
        let recorder = Arc::new(OrderRecorder::default());
        let _subscription = sequencer.subscribe("s1", recorder.clone());

        let mut receipts = Vec::new();
        for &sequence in publish_order {
            receipts.push(sequencer.publish(message("s1", sequence)).await.unwrap());
        }
        for receipt in receipts {
            receipt.wait().await.unwrap();
        }

        assert_eq!(recorder.seen(), [0, 1, 2]);
    }

    #[tokio::test]
    async fn duplicate_sequence_is_rejected_and_never_delivered() {
        let sequencer = Sequencer::new();
        let recorder = Arc::new(OrderRecorder::default());
        let _subscription = sequencer.subscribe("s1", recorder.clone());

        sequencer.publish(message("s1", 0)).await.unwrap();
        let error = sequencer.publish(message("s1", 0)).await.unwrap_err();

        assert_eq!(error.sequence, 0);
        assert_eq!(error.last_delivered, Some(0));
        assert_eq!(recorder.seen(), [0]);
    }

    #[tokio::test]
    async fn duplicate_buffered_sequence_is_rejected() {
        let sequencer = Sequencer::new();
        let _receipt = sequencer.publish(message("s1", 5)).await.unwrap();
        let error = sequencer.publish(message("s1", 5)).await.unwrap_err();
        assert_eq!(error.sequence, 5);
        assert_eq!(error.last_delivered, None);
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let sequencer = Sequencer::new();
        let first = Arc::new(OrderRecorder::default());
        let second = Arc::new(OrderRecorder::default());
        let _first_sub = sequencer.subscribe("s1", first.clone());
        let _second_sub = sequencer.subscribe("s2", second.clone());

        sequencer.publish(message("s1", 0)).await.unwrap();
        sequencer.publish(message("s2", 0)).await.unwrap();
        sequencer.publish(message("s2", 1)).await.unwrap();

        assert_eq!(first.seen(), [0]);
        assert_eq!(second.seen(), [0, 1]);
    }

    #[tokio::test]
    async fn cancelled_message_advances_without_delivery() {
        let sequencer = Sequencer::new();
        let recorder = Arc::new(OrderRecorder::default());
        let _subscription = sequencer.subscribe("s1", recorder.clone());

        let receipt = sequencer.publish(message("s1", 1)).await.unwrap();
        receipt.cancel();

        sequencer.publish(message("s1", 0)).await.unwrap();
        sequencer.publish(message("s1", 2)).await.unwrap();

        // 1 advanced the position but was never handed to the listener.
        assert_eq!(recorder.seen(), [0, 2]);
        receipt.wait().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_subscription_stops_receiving() {
        let sequencer = Sequencer::new();
        let recorder = Arc::new(OrderRecorder::default());
        let subscription = sequencer.subscribe("s1", recorder.clone());

        sequencer.publish(message("s1", 0)).await.unwrap();
        drop(subscription);
        sequencer.publish(message("s1", 1)).await.unwrap();

        assert_eq!(recorder.seen(), [0]);
    }
}
