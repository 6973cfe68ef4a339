// Copyright (c) The crossrun Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    cancel::CancelSignal,
    errors::CancelError,
    reporter::{
        EventChannel,
        events::{RunEventKind, RunId, RunStats},
    },
    suite::{Suite, SuiteRunContext},
    time::stopwatch,
};
use future_queue::{FutureQueueContext, StreamExt};
use futures::prelude::*;
use std::{
    num::NonZeroUsize,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use tracing::debug;

/// Scheduler options.
#[derive(Debug, Default)]
pub struct SuiteRunnerBuilder {
    max_concurrency: Option<NonZeroUsize>,
}

impl SuiteRunnerBuilder {
    /// Creates a builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bounds how many root suites run concurrently. Unbounded by default.
    pub fn set_max_concurrency(&mut self, max_concurrency: NonZeroUsize) -> &mut Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    /// Creates a scheduler emitting into the given channel.
    pub fn build(self, events: Arc<EventChannel>) -> SuiteRunner {
        SuiteRunner {
            max_concurrency: self.max_concurrency,
            events,
            cancel: CancelSignal::new(),
            run_id: RunId::new_v4(),
        }
    }
}

/// Runs a set of independent root suites with bounded concurrency.
///
/// Created using [`SuiteRunnerBuilder::build`].
#[derive(Debug)]
pub struct SuiteRunner {
    max_concurrency: Option<NonZeroUsize>,
    events: Arc<EventChannel>,
    cancel: CancelSignal,
    run_id: RunId,
}

/// The settled output of [`SuiteRunner::execute`].
#[derive(Debug)]
pub struct RunReport {
    /// Aggregate statistics; `stats.failed_tests` is the sum of failed tests
    /// across all roots.
    pub stats: RunStats,

    /// The settled root suites, in completion order.
    pub suites: Vec<Suite>,
}

struct RootOutcome {
    suite: Suite,
    started: bool,
}

impl SuiteRunner {
    /// The unique id for this run.
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// A handle for requesting cooperative cancellation of the run.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Runs every root suite, admitting up to `max_concurrency` at a time in
    /// input order, and resolves once all of them have settled.
    ///
    /// A root's fatal error is caught and reported; it never aborts
    /// siblings. On cancellation, queued suites are dropped without
    /// starting, running suites settle with `CancelError`, and the overall
    /// operation fails with the cancellation reason once they have.
    pub async fn execute(self, mut suites: Vec<Suite>) -> Result<RunReport, CancelError> {
        let watch = stopwatch();

        for suite in &mut suites {
            suite.resolve(None);
        }
        let initial_root_count = suites.len();
        let test_count = suites.iter().map(Suite::num_tests).sum();
        self.events
            .emit(RunEventKind::RunStarted {
                run_id: self.run_id,
                root_count: initial_root_count,
                test_count,
            })
            .await;

        let running = Arc::new(AtomicUsize::new(0));
        let width = self
            .max_concurrency
            .map(NonZeroUsize::get)
            .unwrap_or_else(|| suites.len().max(1));

        let run_all = stream::iter(suites.into_iter())
            .map(|mut suite| {
                let events = Arc::clone(&self.events);
                let cancel = self.cancel.clone();
                let running = Arc::clone(&running);
                (1usize, move |_cx: FutureQueueContext| async move {
                    if cancel.is_cancelled() {
                        debug!(suite = %suite.id(), "run cancelled, not starting queued suite");
                        return RootOutcome {
                            suite,
                            started: false,
                        };
                    }
                    running.fetch_add(1, Ordering::SeqCst);
                    debug!(suite = %suite.id(), "running root suite");
                    let cx = SuiteRunContext::new(events, cancel);
                    if let Err(error) = suite.run(&cx).await {
                        // The suite already reported its own error; a fatal
                        // root never aborts its siblings.
                        debug!(suite = %suite.id(), %error, "root suite settled with fatal error");
                    }
                    running.fetch_sub(1, Ordering::SeqCst);
                    RootOutcome {
                        suite,
                        started: true,
                    }
                })
            })
            // Suites are admitted in input order but settle in any order.
            .future_queue(width)
            .collect::<Vec<_>>();

        let mut run_all = std::pin::pin!(run_all);
        let mut cancel_announced = false;
        let outcomes = loop {
            tokio::select! {
                // The cancellation notice must win a tie, or suites that
                // settle in the same poll would suppress it.
                biased;
                reason = self.cancel.cancelled(), if !cancel_announced => {
                    cancel_announced = true;
                    self.events
                        .emit(RunEventKind::RunBeginCancel {
                            running: running.load(Ordering::SeqCst),
                            reason,
                        })
                        .await;
                }
                outcomes = &mut run_all => break outcomes,
            }
        };

        let mut stats = RunStats {
            initial_root_count,
            ..RunStats::default()
        };
        let mut settled = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            if outcome.started {
                stats.roots_run += 1;
                stats.tests += outcome.suite.num_tests();
                stats.failed_tests += outcome.suite.num_failed_tests();
                stats.skipped_tests += outcome.suite.num_skipped_tests();
                if outcome
                    .suite
                    .error()
                    .is_some_and(|error| !error.is_cancelled())
                {
                    stats.fatal_suite_errors += 1;
                }
            }
            settled.push(outcome.suite);
        }

        let snapshot = watch.snapshot();
        self.events
            .emit(RunEventKind::RunFinished {
                run_id: self.run_id,
                start_time: snapshot.start_time.fixed_offset(),
                elapsed: snapshot.duration,
                stats,
            })
            .await;

        match self.cancel.error() {
            Some(error) => Err(error),
            None => Ok(RunReport {
                stats,
                suites: settled,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        reporter::{events::CancelReason, test_helpers::RecordingReporter},
        suite::Test,
    };
    use pretty_assertions::assert_eq;
    use std::{
        sync::atomic::AtomicBool,
        time::Duration,
    };

    fn runner_with_reporter(
        max_concurrency: Option<usize>,
    ) -> (SuiteRunner, Arc<RecordingReporter>) {
        let reporter = Arc::new(RecordingReporter::default());
        let mut channel = EventChannel::new();
        channel.add_reporter(reporter.clone());
        let mut builder = SuiteRunnerBuilder::new();
        if let Some(n) = max_concurrency {
            builder.set_max_concurrency(NonZeroUsize::new(n).unwrap());
        }
        (builder.build(Arc::new(channel)), reporter)
    }

    /// Tracks how many suite bodies are in flight at once.
    #[derive(Default)]
    struct ConcurrencyGauge {
        current: AtomicUsize,
        max: AtomicUsize,
    }

    impl ConcurrencyGauge {
        fn enter(&self) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(now, Ordering::SeqCst);
        }

        fn exit(&self) {
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn timed_suite(name: String, gauge: Arc<ConcurrencyGauge>) -> Suite {
        let mut suite = Suite::new(name);
        suite.push(Test::new_async("waits", move || async move {
            gauge.enter();
            tokio::time::sleep(Duration::from_millis(100)).await;
            gauge.exit();
            Ok(())
        }));
        suite
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_stays_within_the_bound() {
        let (runner, _) = runner_with_reporter(Some(2));
        let gauge = Arc::new(ConcurrencyGauge::default());
        let suites = (0..5)
            .map(|index| timed_suite(format!("root{index}"), gauge.clone()))
            .collect();

        let report = runner.execute(suites).await.unwrap();

        assert!(
            gauge.max.load(Ordering::SeqCst) <= 2,
            "at most 2 suites may run at once, saw {}",
            gauge.max.load(Ordering::SeqCst)
        );
        // The result resolves only after every suite has settled.
        assert_eq!(report.stats.roots_run, 5);
        assert_eq!(report.stats.tests, 5);
        assert_eq!(report.stats.failed_tests, 0);
    }

    #[tokio::test]
    async fn failures_are_summed_across_roots() {
        let (runner, _) = runner_with_reporter(None);

        let mut first = Suite::new("first");
        first.push(Test::new("passes", || Ok(())));
        first.push(Test::new("fails", || Err("first broke".into())));
        let mut second = Suite::new("second");
        second.push(Test::new("fails", || Err("second broke".into())));

        let report = runner.execute(vec![first, second]).await.unwrap();

        assert_eq!(report.stats.failed_tests, 2);
        assert_eq!(report.stats.tests, 3);
        assert!(report.stats.has_failures());
    }

    #[tokio::test]
    async fn fatal_root_error_does_not_abort_siblings() {
        let (runner, reporter) = runner_with_reporter(Some(1));

        let mut broken = Suite::new("broken");
        broken.set_setup(|| async { Err("setup exploded".into()) });
        broken.push(Test::new("unreachable", || Ok(())));

        let mut healthy = Suite::new("healthy");
        healthy.push(Test::new("passes", || Ok(())));

        let report = runner.execute(vec![broken, healthy]).await.unwrap();

        assert_eq!(report.stats.fatal_suite_errors, 1);
        assert_eq!(report.stats.roots_run, 2);
        // The broken root's tests never ran, so they contribute no failures.
        assert_eq!(report.stats.failed_tests, 0);

        let names = reporter.event_names();
        assert!(names.contains(&"suiteError:broken".to_owned()));
        assert!(names.contains(&"suiteEnd:healthy".to_owned()));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_drops_queued_suites_and_settles_running_ones() {
        let (runner, reporter) = runner_with_reporter(Some(2));
        let cancel = runner.cancel_signal();

        let started = Arc::new(AtomicUsize::new(0));
        let queued_ran = Arc::new(AtomicBool::new(false));

        let mut suites = Vec::new();
        for index in 0..2 {
            let started = started.clone();
            let mut suite = Suite::new(format!("running{index}"));
            let mut test = Test::new_async("hangs", move || async move {
                started.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            });
            test.set_timeout(Duration::from_secs(7200));
            suite.push(test);
            suites.push(suite);
        }
        let queued_flag = queued_ran.clone();
        let mut queued = Suite::new("queued");
        queued.push(Test::new("never starts", move || {
            queued_flag.store(true, Ordering::SeqCst);
            Ok(())
        }));
        suites.push(queued);

        let execute = runner.execute(suites);
        let canceller = async {
            // Let both running suites block on their bodies first.
            for _ in 0..20 {
                tokio::task::yield_now().await;
            }
            assert_eq!(started.load(Ordering::SeqCst), 2);
            cancel.cancel(CancelReason::Interrupt);
        };
        let (result, ()) = tokio::join!(execute, canceller);

        let error = result.unwrap_err();
        assert_eq!(error.reason, CancelReason::Interrupt);
        assert!(
            !queued_ran.load(Ordering::SeqCst),
            "queued suite must never start"
        );

        let names = reporter.event_names();
        assert!(names.contains(&"runBeginCancel".to_owned()));
        assert!(!names.contains(&"suiteStart:queued".to_owned()));
        // Both running suites settled (their suiteStart events exist, and the
        // run finished) without waiting for the huge timeout.
        assert!(names.contains(&"suiteStart:running0".to_owned()));
        assert!(names.contains(&"suiteStart:running1".to_owned()));
        assert!(names.contains(&"runEnd".to_owned()));
    }
}
