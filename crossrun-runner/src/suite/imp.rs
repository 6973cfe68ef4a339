// Copyright (c) The crossrun Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    cancel::CancelSignal,
    errors::{
        CancelError, HookFailure, LifecycleError, LifecycleMethod, SuiteError, TestError,
        TestFailure, TimeoutError,
    },
    helpers::SetOnce,
    remote::{RemoteHandle, RemoteSuite},
    reporter::{EventChannel, NodeSummary, SuiteSummary, events::RunEventKind},
    suite::{DEFAULT_TIMEOUT, Test},
    time::stopwatch,
};
use debug_ignore::DebugIgnore;
use futures::future::BoxFuture;
use regex::Regex;
use smol_str::SmolStr;
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Shared state a suite tree runs against: the reporting channel and the
/// run's cancellation signal.
#[derive(Clone, Debug)]
pub struct SuiteRunContext {
    events: Arc<EventChannel>,
    cancel: CancelSignal,
}

impl SuiteRunContext {
    /// Creates a run context.
    pub fn new(events: Arc<EventChannel>, cancel: CancelSignal) -> Self {
        Self { events, cancel }
    }

    /// The reporting channel.
    pub fn events(&self) -> &EventChannel {
        &self.events
    }

    /// The run's cancellation signal.
    pub fn cancel(&self) -> &CancelSignal {
        &self.cancel
    }
}

/// A lifecycle hook: `setup`, `before_each`, `after_each` or `teardown`.
///
/// Hooks are `Arc`ed so ancestor hook chains can be carried down the tree
/// during execution.
pub type LifecycleHook =
    Arc<dyn Fn() -> BoxFuture<'static, Result<(), TestFailure>> + Send + Sync>;

fn wrap_hook<F, Fut>(hook: F) -> LifecycleHook
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TestFailure>> + Send + 'static,
{
    Arc::new(move || -> BoxFuture<'static, Result<(), TestFailure>> { Box::pin(hook()) })
}

/// One child of a suite, in registration order.
#[derive(Debug)]
pub enum SuiteChild {
    /// A leaf test, run in-process.
    Test(Test),

    /// A nested suite.
    Suite(Suite),

    /// A suite driven by a remote session.
    Remote(RemoteSuite),
}

impl From<Test> for SuiteChild {
    fn from(test: Test) -> Self {
        SuiteChild::Test(test)
    }
}

impl From<Suite> for SuiteChild {
    fn from(suite: Suite) -> Self {
        SuiteChild::Suite(suite)
    }
}

impl From<RemoteSuite> for SuiteChild {
    fn from(remote: RemoteSuite) -> Self {
        SuiteChild::Remote(remote)
    }
}

/// The per-test hook chains accumulated from a suite's ancestors.
#[derive(Clone, Default)]
pub(crate) struct HookChain {
    /// `before_each` hooks, ancestor first.
    before: Vec<LifecycleHook>,
    /// `after_each` hooks, ancestor first; executed in reverse.
    after: Vec<LifecycleHook>,
}

/// Inherited properties pushed down the tree before a run starts.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedParent {
    pub(crate) id: SmolStr,
    pub(crate) grep: Option<Regex>,
    pub(crate) session_id: Option<SmolStr>,
    pub(crate) remote: Option<RemoteHandle>,
}

/// An ordered tree node owning child tests and suites.
///
/// A suite tree is built during the registration phase and never mutated
/// once `run()` starts; execution mutates only the reporting fields.
#[derive(Debug)]
pub struct Suite {
    name: SmolStr,
    id: SmolStr,
    has_parent: bool,
    children: Vec<SuiteChild>,
    setup: DebugIgnore<Option<LifecycleHook>>,
    before_each: DebugIgnore<Option<LifecycleHook>>,
    after_each: DebugIgnore<Option<LifecycleHook>>,
    teardown: DebugIgnore<Option<LifecycleHook>>,
    grep: Option<Regex>,
    session_id: SetOnce<SmolStr>,
    remote: SetOnce<RemoteHandle>,
    publish_after_setup: bool,
    timeout: Duration,
    error: Option<SuiteError>,
    time_elapsed: Duration,
}

impl Suite {
    /// Creates an empty suite.
    pub fn new(name: impl Into<SmolStr>) -> Self {
        let name = name.into();
        Self {
            id: name.clone(),
            name,
            has_parent: false,
            children: Vec::new(),
            setup: DebugIgnore(None),
            before_each: DebugIgnore(None),
            after_each: DebugIgnore(None),
            teardown: DebugIgnore(None),
            grep: None,
            session_id: SetOnce::default(),
            remote: SetOnce::default(),
            publish_after_setup: false,
            timeout: DEFAULT_TIMEOUT,
            error: None,
            time_elapsed: Duration::ZERO,
        }
    }

    /// Registers a child. Insertion order is execution order.
    pub fn push(&mut self, child: impl Into<SuiteChild>) -> &mut Self {
        self.children.push(child.into());
        self
    }

    /// Sets the `setup` hook, invoked once before any child runs.
    pub fn set_setup<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TestFailure>> + Send + 'static,
    {
        self.setup = DebugIgnore(Some(wrap_hook(hook)));
        self
    }

    /// Sets the `before_each` hook, invoked before every descendant test.
    pub fn set_before_each<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TestFailure>> + Send + 'static,
    {
        self.before_each = DebugIgnore(Some(wrap_hook(hook)));
        self
    }

    /// Sets the `after_each` hook, invoked after every descendant test.
    pub fn set_after_each<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TestFailure>> + Send + 'static,
    {
        self.after_each = DebugIgnore(Some(wrap_hook(hook)));
        self
    }

    /// Sets the `teardown` hook, invoked once after all children settle.
    pub fn set_teardown<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TestFailure>> + Send + 'static,
    {
        self.teardown = DebugIgnore(Some(wrap_hook(hook)));
        self
    }

    /// Sets the grep pattern selecting which tests execute by id. Inherited
    /// by descendants that don't set their own.
    pub fn set_grep(&mut self, grep: Regex) -> &mut Self {
        self.grep = Some(grep);
        self
    }

    /// Defers the `suiteStart` event and the timing boundary until after
    /// `setup` succeeds, and emits `suiteEnd` before `teardown`.
    pub fn set_publish_after_setup(&mut self, publish_after_setup: bool) -> &mut Self {
        self.publish_after_setup = publish_after_setup;
        self
    }

    /// Sets the timeout applied to each lifecycle hook invocation.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    /// Sets the remote session id. May be set exactly once; descendants
    /// inherit it. A second write panics.
    pub fn set_session_id(&mut self, session_id: impl Into<SmolStr>) -> &mut Self {
        self.session_id.set("session_id", session_id.into());
        self
    }

    /// Attaches the remote handle. May be set exactly once; descendants
    /// inherit it. Also adopts the handle's session id if none is set.
    pub fn set_remote(&mut self, remote: RemoteHandle) -> &mut Self {
        self.session_id.set_if_unset(remote.session_id().clone());
        self.remote.set("remote", remote);
        self
    }

    /// The suite name.
    pub fn name(&self) -> &SmolStr {
        &self.name
    }

    /// The full id: the names of the suite and its ancestors joined. Equal
    /// to the bare name until the tree is resolved at the start of a run.
    pub fn id(&self) -> &SmolStr {
        &self.id
    }

    /// False for root suites.
    pub fn has_parent(&self) -> bool {
        self.has_parent
    }

    /// The children, in registration order.
    pub fn children(&self) -> &[SuiteChild] {
        &self.children
    }

    /// The remote session id, explicit or inherited.
    pub fn session_id(&self) -> Option<&SmolStr> {
        self.session_id.get()
    }

    /// The remote handle, explicit or inherited.
    pub fn remote(&self) -> Option<&RemoteHandle> {
        self.remote.get()
    }

    /// The fatal lifecycle error that settled this suite, if any.
    pub fn error(&self) -> Option<&SuiteError> {
        self.error.as_ref()
    }

    /// Wall-clock time the suite took to run. The measured window reflects
    /// the `publish_after_setup` boundary.
    pub fn time_elapsed(&self) -> Duration {
        self.time_elapsed
    }

    /// The number of tests in the subtree. Computed on demand, never cached.
    pub fn num_tests(&self) -> usize {
        self.children
            .iter()
            .map(|child| match child {
                SuiteChild::Test(_) => 1,
                SuiteChild::Suite(suite) => suite.num_tests(),
                SuiteChild::Remote(remote) => remote.num_tests(),
            })
            .sum()
    }

    /// The number of failed tests in the subtree.
    pub fn num_failed_tests(&self) -> usize {
        self.children
            .iter()
            .map(|child| match child {
                SuiteChild::Test(test) => usize::from(test.counts_as_failed()),
                SuiteChild::Suite(suite) => suite.num_failed_tests(),
                SuiteChild::Remote(remote) => remote.num_failed_tests(),
            })
            .sum()
    }

    /// The number of skipped tests in the subtree.
    pub fn num_skipped_tests(&self) -> usize {
        self.children
            .iter()
            .map(|child| match child {
                SuiteChild::Test(test) => usize::from(test.skipped().is_some()),
                SuiteChild::Suite(suite) => suite.num_skipped_tests(),
                SuiteChild::Remote(remote) => remote.num_skipped_tests(),
            })
            .sum()
    }

    /// Serializes the suite and its subtree for reporters.
    pub fn summarize(&self) -> SuiteSummary {
        SuiteSummary {
            name: self.name.clone(),
            id: self.id.clone(),
            session_id: self.session_id.get().cloned(),
            has_parent: self.has_parent,
            tests: self
                .children
                .iter()
                .map(|child| match child {
                    SuiteChild::Test(test) => NodeSummary::Test(test.summarize()),
                    SuiteChild::Suite(suite) => NodeSummary::Suite(suite.summarize()),
                    SuiteChild::Remote(remote) => NodeSummary::Suite(remote.summarize()),
                })
                .collect(),
            time_elapsed: self.time_elapsed,
            num_tests: self.num_tests(),
            num_failed_tests: self.num_failed_tests(),
            num_skipped_tests: self.num_skipped_tests(),
            error: self.error.as_ref().map(SuiteError::to_summary),
        }
    }

    pub(crate) fn record_error(&mut self, error: SuiteError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    pub(crate) fn record_time_elapsed(&mut self, time_elapsed: Duration) {
        self.time_elapsed = time_elapsed;
    }

    /// Assigns ids and pushes inherited properties down the tree. Idempotent;
    /// runs before execution starts.
    pub(crate) fn resolve(&mut self, parent: Option<&ResolvedParent>) {
        match parent {
            Some(parent) => {
                self.has_parent = true;
                self.id = format!("{} - {}", parent.id, self.name).into();
                if self.grep.is_none() {
                    self.grep = parent.grep.clone();
                }
                if let Some(session_id) = &parent.session_id {
                    self.session_id.set_if_unset(session_id.clone());
                }
                if let Some(remote) = &parent.remote {
                    self.remote.set_if_unset(remote.clone());
                }
            }
            None => {
                self.has_parent = false;
                self.id = self.name.clone();
            }
        }

        let me = ResolvedParent {
            id: self.id.clone(),
            grep: self.grep.clone(),
            session_id: self.session_id.get().cloned(),
            remote: self.remote.get().cloned(),
        };
        for child in &mut self.children {
            match child {
                SuiteChild::Test(test) => test.resolve(&me.id, me.session_id.as_ref()),
                SuiteChild::Suite(suite) => suite.resolve(Some(&me)),
                SuiteChild::Remote(remote) => remote.resolve(&me),
            }
        }
    }

    /// Runs this suite as a root: resolves the tree, then drives the
    /// lifecycle state machine.
    ///
    /// Test-body failures are aggregated, not fatal; `run` only fails for
    /// fatal lifecycle errors (`setup`/`teardown`), a failed remote session,
    /// or cancellation.
    pub async fn run(&mut self, cx: &SuiteRunContext) -> Result<(), SuiteError> {
        self.resolve(None);
        self.run_inner(cx, HookChain::default()).await
    }

    pub(crate) fn run_inner<'a>(
        &'a mut self,
        cx: &'a SuiteRunContext,
        chain: HookChain,
    ) -> BoxFuture<'a, Result<(), SuiteError>> {
        Box::pin(async move {
            let setup_hook = (*self.setup).clone();
            let before_hook = (*self.before_each).clone();
            let after_hook = (*self.after_each).clone();
            let teardown_hook = (*self.teardown).clone();
            let grep = self.grep.clone();
            let hook_timeout = self.timeout;

            let mut watch = None;
            if !self.publish_after_setup {
                watch = Some(stopwatch());
                cx.events()
                    .emit(RunEventKind::SuiteStarted {
                        suite: self.summarize(),
                    })
                    .await;
            }

            let mut fatal: Option<SuiteError> = None;

            if let Some(error) = cx.cancel().error() {
                fatal = Some(error.into());
            }

            if fatal.is_none() {
                if let Some(hook) = &setup_hook {
                    if let Err(error) = run_hook(
                        hook,
                        LifecycleMethod::Setup,
                        None,
                        hook_timeout,
                        true,
                        cx.cancel(),
                    )
                    .await
                    {
                        let error = SuiteError::Lifecycle(error);
                        self.error = Some(error.clone());
                        cx.events()
                            .emit(RunEventKind::SuiteErrored {
                                suite: self.summarize(),
                                error: error.to_summary(),
                            })
                            .await;
                        fatal = Some(error);
                    }
                }
            }

            if fatal.is_none() && self.publish_after_setup {
                watch = Some(stopwatch());
                cx.events()
                    .emit(RunEventKind::SuiteStarted {
                        suite: self.summarize(),
                    })
                    .await;
            }

            // Children run strictly in registration order; a fatal error in a
            // nested suite stops later siblings but never skips teardown.
            if fatal.is_none() {
                let mut child_chain = chain.clone();
                if let Some(hook) = &before_hook {
                    child_chain.before.push(hook.clone());
                }
                if let Some(hook) = &after_hook {
                    child_chain.after.push(hook.clone());
                }

                for index in 0..self.children.len() {
                    if let Some(error) = cx.cancel().error() {
                        fatal = Some(error.into());
                        break;
                    }
                    match &mut self.children[index] {
                        SuiteChild::Test(test) => {
                            run_test(test, &child_chain, grep.as_ref(), hook_timeout, cx).await;
                        }
                        SuiteChild::Suite(suite) => {
                            if let Err(error) = suite.run_inner(cx, child_chain.clone()).await {
                                // The child already reported its own error.
                                self.error = Some(error.clone());
                                fatal = Some(error);
                                break;
                            }
                        }
                        SuiteChild::Remote(remote) => {
                            if let Err(error) = remote.run(cx).await {
                                self.error = Some(error.clone());
                                fatal = Some(error);
                                break;
                            }
                        }
                    }
                }
            }

            // Settling due to cancellation skips teardown that hasn't
            // started; anything already in flight has completed above.
            if matches!(&fatal, Some(error) if error.is_cancelled()) {
                let error = fatal.expect("checked above");
                self.error = Some(error.clone());
                return Err(error);
            }

            if self.publish_after_setup {
                // suiteEnd precedes teardown in this mode, so teardown
                // failures settle the run but don't appear in the event.
                if let Some(watch) = &watch {
                    self.time_elapsed = watch.snapshot().duration;
                }
                cx.events()
                    .emit(RunEventKind::SuiteFinished {
                        suite: self.summarize(),
                    })
                    .await;
                self.run_teardown(teardown_hook.as_ref(), hook_timeout, &mut fatal, cx)
                    .await;
            } else {
                self.run_teardown(teardown_hook.as_ref(), hook_timeout, &mut fatal, cx)
                    .await;
                if let Some(watch) = &watch {
                    self.time_elapsed = watch.snapshot().duration;
                }
                cx.events()
                    .emit(RunEventKind::SuiteFinished {
                        suite: self.summarize(),
                    })
                    .await;
            }

            match fatal {
                None => Ok(()),
                Some(error) => Err(error),
            }
        })
    }

    /// Teardown always runs, even after a setup failure. The first fatal
    /// error wins; a teardown failure that would shadow it is logged.
    async fn run_teardown(
        &mut self,
        teardown_hook: Option<&LifecycleHook>,
        hook_timeout: Duration,
        fatal: &mut Option<SuiteError>,
        cx: &SuiteRunContext,
    ) {
        let Some(hook) = teardown_hook else {
            return;
        };
        if let Err(error) = run_hook(
            hook,
            LifecycleMethod::Teardown,
            None,
            hook_timeout,
            false,
            cx.cancel(),
        )
        .await
        {
            let error = SuiteError::Lifecycle(error);
            if fatal.is_none() {
                self.error = Some(error.clone());
                cx.events()
                    .emit(RunEventKind::SuiteErrored {
                        suite: self.summarize(),
                        error: error.to_summary(),
                    })
                    .await;
                *fatal = Some(error);
            } else {
                warn!(suite = %self.id, %error, "teardown also failed; keeping the first error");
            }
        }
    }
}

/// Invokes one lifecycle hook, bounded by the suite's hook timeout.
///
/// Cleanup hooks (`after_each`, `teardown`) are not interruptible: once
/// started they run to completion even under cancellation.
async fn run_hook(
    hook: &LifecycleHook,
    method: LifecycleMethod,
    related_test: Option<&SmolStr>,
    timeout: Duration,
    interruptible: bool,
    cancel: &CancelSignal,
) -> Result<(), LifecycleError> {
    fn settle(
        result: Result<Result<(), TestFailure>, tokio::time::error::Elapsed>,
        timeout: Duration,
    ) -> Result<(), HookFailure> {
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(failure)) => Err(failure.into()),
            Err(_) => Err(TimeoutError { timeout }.into()),
        }
    }

    let fut = hook();
    let outcome = if interruptible {
        tokio::select! {
            result = tokio::time::timeout(timeout, fut) => settle(result, timeout),
            reason = cancel.cancelled() => Err(CancelError { reason }.into()),
        }
    } else {
        settle(tokio::time::timeout(timeout, fut).await, timeout)
    };

    outcome.map_err(|source| LifecycleError::new(method, related_test.cloned(), source))
}

/// Runs one test child: the full `before_each` chain ancestor-to-descendant,
/// the body, then the full `after_each` chain in reverse.
///
/// Grep mismatches skip the body but not the hook chains; skip is a
/// test-body concern, not a lifecycle one.
async fn run_test(
    test: &mut Test,
    chain: &HookChain,
    grep: Option<&Regex>,
    hook_timeout: Duration,
    cx: &SuiteRunContext,
) {
    cx.events()
        .emit(RunEventKind::TestStarted {
            test: test.summarize(),
        })
        .await;

    if let Some(grep) = grep {
        if !grep.is_match(test.id()) {
            test.mark_skipped("grep");
        }
    }

    let mut halted = false;
    for hook in &chain.before {
        if let Err(error) = run_hook(
            hook,
            LifecycleMethod::BeforeEach,
            Some(test.id()),
            hook_timeout,
            true,
            cx.cancel(),
        )
        .await
        {
            debug!(test = %test.id(), %error, "beforeEach failed; not running body");
            test.fail_with(TestError::Lifecycle(error));
            halted = true;
            break;
        }
    }

    if !halted {
        test.run_body(cx.cancel()).await;
    }

    // Best-effort cleanup: the whole chain runs even if a step fails, and
    // the first error wins.
    let mut after_error: Option<LifecycleError> = None;
    for hook in chain.after.iter().rev() {
        if let Err(error) = run_hook(
            hook,
            LifecycleMethod::AfterEach,
            Some(test.id()),
            hook_timeout,
            false,
            cx.cancel(),
        )
        .await
        {
            if after_error.is_none() {
                after_error = Some(error);
            } else {
                warn!(test = %test.id(), %error, "afterEach also failed; keeping the first error");
            }
        }
    }
    if let Some(error) = after_error {
        if test.error().is_none() {
            test.fail_with(TestError::Lifecycle(error));
        }
    }

    cx.events()
        .emit(RunEventKind::TestFinished {
            test: test.summarize(),
        })
        .await;
}
