// Copyright (c) The crossrun Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::{CancelError, ConnectTimeoutError, ListenerError, SuiteError},
    remote::{SequencedMessage, Sequencer, SessionListener},
    reporter::{NodeSummary, SuiteSummary, events::RunEventKind},
    suite::{ResolvedParent, Suite, SuiteRunContext},
    time::stopwatch,
};
use futures::future::BoxFuture;
use serde_json::Value;
use smol_str::SmolStr;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// The default time a remote session gets to report itself initialized.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A suite driven by a remote session instead of running bodies in-process.
///
/// A `RemoteSuite` owns a [`Suite`] core for identity, timing and error
/// bookkeeping, and replaces local execution with a subscription to the
/// [`Sequencer`]'s ordered stream for its session. Its logical test tree is
/// whatever the remote last reported for its root suite.
#[derive(Debug)]
pub struct RemoteSuite {
    core: Suite,
    sequencer: Arc<Sequencer>,
    connect_timeout: Duration,
    remote_tree: Vec<NodeSummary>,
}

impl RemoteSuite {
    /// Creates a remote suite fed by the given sequencer.
    pub fn new(name: impl Into<SmolStr>, sequencer: Arc<Sequencer>) -> Self {
        Self {
            core: Suite::new(name),
            sequencer,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            remote_tree: Vec::new(),
        }
    }

    /// Sets how long the remote session gets to report itself initialized.
    pub fn set_connect_timeout(&mut self, connect_timeout: Duration) -> &mut Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Sets the remote session id. May be set exactly once; inherited from
    /// the parent suite if unset.
    pub fn set_session_id(&mut self, session_id: impl Into<SmolStr>) -> &mut Self {
        self.core.set_session_id(session_id);
        self
    }

    /// The suite name.
    pub fn name(&self) -> &SmolStr {
        self.core.name()
    }

    /// The full id.
    pub fn id(&self) -> &SmolStr {
        self.core.id()
    }

    /// The session this suite is driven by.
    pub fn session_id(&self) -> Option<&SmolStr> {
        self.core.session_id()
    }

    /// The error that settled this suite, if any.
    pub fn error(&self) -> Option<&SuiteError> {
        self.core.error()
    }

    /// The number of tests the remote last reported.
    pub fn num_tests(&self) -> usize {
        self.remote_tree.iter().map(NodeSummary::num_tests).sum()
    }

    /// The number of failed tests the remote last reported.
    pub fn num_failed_tests(&self) -> usize {
        self.remote_tree
            .iter()
            .map(NodeSummary::num_failed_tests)
            .sum()
    }

    /// The number of skipped tests the remote last reported.
    pub fn num_skipped_tests(&self) -> usize {
        self.remote_tree
            .iter()
            .map(NodeSummary::num_skipped_tests)
            .sum()
    }

    /// Serializes this suite with its current logical test tree.
    pub fn summarize(&self) -> SuiteSummary {
        SuiteSummary {
            name: self.core.name().clone(),
            id: self.core.id().clone(),
            session_id: self.core.session_id().cloned(),
            has_parent: self.core.has_parent(),
            tests: self.remote_tree.clone(),
            time_elapsed: self.core.time_elapsed(),
            num_tests: self.num_tests(),
            num_failed_tests: self.num_failed_tests(),
            num_skipped_tests: self.num_skipped_tests(),
            error: self.core.error().map(SuiteError::to_summary),
        }
    }

    pub(crate) fn resolve(&mut self, parent: &ResolvedParent) {
        self.core.resolve(Some(parent));
    }

    /// Runs the suite by consuming the session's ordered event stream.
    ///
    /// Fails with a connect-timeout error if the session does not report
    /// `remoteStatus: initialized` within the connect timeout; resolves when
    /// the remote reports `runEnd`.
    pub async fn run(&mut self, cx: &SuiteRunContext) -> Result<(), SuiteError> {
        let session_id = self
            .core
            .session_id()
            .cloned()
            .expect("remote suite requires a session id (set one or inherit it from the parent)");

        let (sender, mut receiver) = mpsc::unbounded_channel();
        let _subscription = self
            .sequencer
            .subscribe(session_id.clone(), Arc::new(ChannelListener { sender }));
        let watch = stopwatch();

        // Nothing else the session says is meaningful until it has reported
        // itself initialized.
        tokio::select! {
            gate = tokio::time::timeout(self.connect_timeout, wait_for_initialized(&mut receiver)) => {
                match gate {
                    Ok(true) => {}
                    Ok(false) => {
                        let error = self
                            .fail_session(cx, &session_id, "session event stream closed before initialization")
                            .await;
                        return Err(error);
                    }
                    Err(_) => {
                        let error = SuiteError::ConnectTimeout(ConnectTimeoutError {
                            session_id: session_id.clone(),
                            timeout: self.connect_timeout,
                        });
                        self.core.record_error(error.clone());
                        cx.events()
                            .emit(RunEventKind::SuiteErrored {
                                suite: self.summarize(),
                                error: error.to_summary(),
                            })
                            .await;
                        return Err(error);
                    }
                }
            }
            reason = cx.cancel().cancelled() => {
                return Err(CancelError { reason }.into());
            }
        }

        loop {
            tokio::select! {
                reason = cx.cancel().cancelled() => {
                    // Dropping the subscription detaches us from the session.
                    return Err(CancelError { reason }.into());
                }
                message = receiver.recv() => {
                    let Some(message) = message else {
                        let error = self
                            .fail_session(cx, &session_id, "session event stream closed before runEnd")
                            .await;
                        return Err(error);
                    };
                    match message.payload.name.as_str() {
                        "remoteStatus" => {
                            debug!(session_id = %session_id, "ignoring repeated remoteStatus");
                        }
                        "suiteStart" => {
                            self.handle_suite_boundary(cx, &session_id, true, &message).await?;
                        }
                        "suiteEnd" => {
                            self.handle_suite_boundary(cx, &session_id, false, &message).await?;
                        }
                        "error" => {
                            let message = remote_fault_message(&message.payload.args);
                            let error = self.fail_session(cx, &session_id, &message).await;
                            return Err(error);
                        }
                        "runEnd" => {
                            if self.core.time_elapsed().is_zero() {
                                self.core.record_time_elapsed(watch.snapshot().duration);
                            }
                            return Ok(());
                        }
                        // These belong to the remote's own nested executor
                        // and are not meaningful at this level.
                        "beforeRun" | "afterRun" | "runStart" => {
                            debug!(
                                session_id = %session_id,
                                name = %message.payload.name,
                                "consuming remote executor event"
                            );
                        }
                        _ => {
                            cx.events()
                                .emit(RunEventKind::RemoteForwarded {
                                    session_id: session_id.clone(),
                                    name: message.payload.name.clone(),
                                    args: message.payload.args.clone(),
                                })
                                .await;
                        }
                    }
                }
            }
        }
    }

    /// Handles a remote `suiteStart`/`suiteEnd`. Root events replace the
    /// logical tree wholesale and are re-tagged with this suite's own
    /// identity; non-root events pass through with the remote's data.
    async fn handle_suite_boundary(
        &mut self,
        cx: &SuiteRunContext,
        session_id: &SmolStr,
        is_start: bool,
        message: &SequencedMessage,
    ) -> Result<(), SuiteError> {
        let name = &message.payload.name;
        let Some(data) = message.payload.args.first() else {
            let error = self
                .fail_session(cx, session_id, &format!("{name} event carried no suite data"))
                .await;
            return Err(error);
        };
        let summary: SuiteSummary = match serde_json::from_value(data.clone()) {
            Ok(summary) => summary,
            Err(decode_error) => {
                let error = self
                    .fail_session(
                        cx,
                        session_id,
                        &format!("malformed {name} payload: {decode_error}"),
                    )
                    .await;
                return Err(error);
            }
        };

        if summary.has_parent {
            // Pass-through: downstream reporters see the remote's own data.
            let kind = if is_start {
                RunEventKind::SuiteStarted { suite: summary }
            } else {
                RunEventKind::SuiteFinished { suite: summary }
            };
            cx.events().emit(kind).await;
            return Ok(());
        }

        self.remote_tree = summary.tests;
        if !is_start {
            self.core.record_time_elapsed(summary.time_elapsed);
            if let Some(error) = summary.error {
                warn!(
                    session_id = %session_id,
                    message = %error.message,
                    "remote root suite ended with an error"
                );
                self.core.record_error(SuiteError::Remote {
                    session_id: session_id.clone(),
                    message: error.message,
                });
            }
        }
        // Tag the event with this suite's own data so downstream reporters
        // see a stable identity.
        let kind = if is_start {
            RunEventKind::SuiteStarted {
                suite: self.summarize(),
            }
        } else {
            RunEventKind::SuiteFinished {
                suite: self.summarize(),
            }
        };
        cx.events().emit(kind).await;
        Ok(())
    }

    async fn fail_session(
        &mut self,
        cx: &SuiteRunContext,
        session_id: &SmolStr,
        message: &str,
    ) -> SuiteError {
        let error = SuiteError::Remote {
            session_id: session_id.clone(),
            message: message.to_owned(),
        };
        self.core.record_error(error.clone());
        cx.events()
            .emit(RunEventKind::SuiteErrored {
                suite: self.summarize(),
                error: error.to_summary(),
            })
            .await;
        error
    }
}

/// Bridges sequencer deliveries into the run loop's channel.
struct ChannelListener {
    sender: UnboundedSender<SequencedMessage>,
}

impl SessionListener for ChannelListener {
    fn deliver<'a>(
        &'a self,
        message: &'a SequencedMessage,
    ) -> BoxFuture<'a, Result<(), ListenerError>> {
        // A closed receiver means the remote run already settled; late
        // messages are not listener errors.
        let _ = self.sender.send(message.clone());
        Box::pin(async { Ok(()) })
    }
}

async fn wait_for_initialized(receiver: &mut UnboundedReceiver<SequencedMessage>) -> bool {
    while let Some(message) = receiver.recv().await {
        if message.payload.name == "remoteStatus" {
            if message.payload.args.first().and_then(Value::as_str) == Some("initialized") {
                return true;
            }
            debug!(status = ?message.payload.args.first(), "ignoring non-initialized remoteStatus");
        } else {
            warn!(
                name = %message.payload.name,
                "ignoring session event before initialization"
            );
        }
    }
    false
}

fn remote_fault_message(args: &[Value]) -> String {
    match args.first() {
        Some(Value::String(message)) => message.clone(),
        Some(value) => value
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_owned)
            .unwrap_or_else(|| value.to_string()),
        None => "remote error with no details".to_owned(),
    }
}
