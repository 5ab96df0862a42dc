use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};

use crate::executor::ResetExecutor;
use crate::job::{HostResetOutcome, CODE_JOB_JOIN_FAILED};
use crate::models::{
    DispatchMode, ExecutionPlan, FleetReport, FleetSummary, HostResetResult, HostResetStatus,
    HostTarget, ProgressEvent, RunOptions,
};
use crate::report::{progress_channel, Reporter};

pub const DEFAULT_PARALLEL_LIMIT: usize = 8;

type CollectedResults = Arc<AsyncMutex<BTreeMap<String, (HostResetResult, String)>>>;

pub fn build_execution_plan(targets: Vec<HostTarget>, options: RunOptions) -> ExecutionPlan {
    ExecutionPlan {
        run_id: uuid::Uuid::new_v4().to_string(),
        targets,
        options,
    }
}

/// 0 when every host succeeded, 1 when any failed.
pub fn exit_code_for(summary: &FleetSummary) -> i32 {
    if summary.failed > 0 {
        1
    } else {
        0
    }
}

/// Dispatch the plan and aggregate per-host outcomes. Serial mode totally
/// orders the jobs; parallel mode fans out one task per host under the
/// plan's concurrency limit and joins every task before returning.
pub async fn run_fleet_reset<E>(
    executor: Arc<E>,
    plan: ExecutionPlan,
    reporter: Arc<dyn Reporter>,
) -> FleetReport
where
    E: ResetExecutor + 'static,
{
    let started_at = Utc::now();
    reporter.progress(&ProgressEvent {
        host: None,
        phase: "queued".to_string(),
        message: format!(
            "Run {} accepted for {} host(s)",
            plan.run_id,
            plan.targets.len()
        ),
        timestamp: started_at,
    });

    if plan.options.dry_run {
        return dry_run_report(&plan, reporter, started_at);
    }

    let collected: CollectedResults = Arc::new(AsyncMutex::new(BTreeMap::new()));

    match plan.options.dispatch {
        DispatchMode::Serial => {
            for target in &plan.targets {
                run_host_job(
                    executor.clone(),
                    target.clone(),
                    reporter.clone(),
                    collected.clone(),
                )
                .await;
            }
        }
        DispatchMode::Parallel => {
            let limit = plan.options.max_concurrent.max(1);
            let semaphore = Arc::new(Semaphore::new(limit));
            let mut handles = Vec::new();

            for target in plan.targets.iter().cloned() {
                let executor = executor.clone();
                let reporter = reporter.clone();
                let collected = collected.clone();
                let semaphore = semaphore.clone();

                handles.push(tokio::spawn(async move {
                    let permit = semaphore.acquire_owned().await;
                    if permit.is_err() {
                        return;
                    }
                    let _permit = permit.expect("semaphore permit should exist");

                    run_host_job(executor, target, reporter, collected).await;
                }));
            }

            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    let collected = std::mem::take(&mut *collected.lock().await);
    assemble_report(&plan, collected, started_at, reporter)
}

fn dry_run_report(
    plan: &ExecutionPlan,
    reporter: Arc<dyn Reporter>,
    started_at: chrono::DateTime<Utc>,
) -> FleetReport {
    // Rendered serially in resolution order whatever the dispatch mode, and
    // before any session could exist.
    let mut results = Vec::new();
    for target in &plan.targets {
        let label = target.label();
        reporter.would_reset(&label);
        results.push(HostResetResult {
            host: label,
            status: HostResetStatus::Success,
            phase: "dry-run".to_string(),
            phases: Vec::new(),
            error_code: None,
            error_message: None,
        });
    }

    FleetReport {
        summary: FleetSummary {
            run_id: plan.run_id.clone(),
            total: results.len(),
            succeeded: results.len(),
            failed: 0,
            started_at,
            finished_at: Some(Utc::now()),
        },
        results,
        raw_logs: BTreeMap::new(),
    }
}

async fn run_host_job<E>(
    executor: Arc<E>,
    target: HostTarget,
    reporter: Arc<dyn Reporter>,
    collected: CollectedResults,
) where
    E: ResetExecutor + 'static,
{
    let label = target.label();
    let (progress_tx, mut progress_rx) = progress_channel();

    let reporter_for_progress = reporter.clone();
    let progress_forwarder = tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            reporter_for_progress.progress(&event);
        }
    });

    let join_result = tokio::task::spawn_blocking({
        let executor = executor.clone();
        let target = target.clone();
        let progress_tx = progress_tx.clone();
        move || executor.reset_host(&target, &progress_tx)
    })
    .await;

    drop(progress_tx);
    let _ = progress_forwarder.await;

    let outcome = match join_result {
        Ok(outcome) => outcome,
        Err(error) => HostResetOutcome::failure(
            "dispatch",
            CODE_JOB_JOIN_FAILED,
            format!("Reset job join failed: {error}"),
            String::new(),
        ),
    };

    reporter.completion(&label, &outcome);

    let (result, raw_log) = outcome.into_result(&label);
    collected.lock().await.insert(label, (result, raw_log));
}

fn assemble_report(
    plan: &ExecutionPlan,
    mut collected: BTreeMap<String, (HostResetResult, String)>,
    started_at: chrono::DateTime<Utc>,
    reporter: Arc<dyn Reporter>,
) -> FleetReport {
    let mut results = Vec::new();
    let mut raw_logs = BTreeMap::new();
    for target in &plan.targets {
        let label = target.label();
        if let Some((result, raw_log)) = collected.remove(&label) {
            results.push(result);
            if !raw_log.is_empty() {
                raw_logs.insert(label, raw_log);
            }
        }
    }

    let succeeded = results
        .iter()
        .filter(|result| result.status == HostResetStatus::Success)
        .count();
    let failed = results.len() - succeeded;

    let summary = FleetSummary {
        run_id: plan.run_id.clone(),
        total: plan.targets.len(),
        succeeded,
        failed,
        started_at,
        finished_at: Some(Utc::now()),
    };

    reporter.progress(&ProgressEvent {
        host: None,
        phase: "done".to_string(),
        message: format!(
            "Run finished: {} succeeded, {} failed",
            summary.succeeded, summary.failed
        ),
        timestamp: Utc::now(),
    });

    FleetReport {
        summary,
        results,
        raw_logs,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use super::{build_execution_plan, exit_code_for, run_fleet_reset};
    use crate::executor::ResetExecutor;
    use crate::job::{HostResetOutcome, HostResetSuccess};
    use crate::models::{
        DispatchMode, HostResetStatus, HostTarget, ProgressEvent, RunOptions,
    };
    use crate::report::{ProgressSender, Reporter};

    struct FakeExecutor {
        latency: Duration,
        fail_hosts: HashSet<String>,
        calls: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent_seen: AtomicUsize,
        spans: Mutex<Vec<(String, Instant, Instant)>>,
    }

    impl FakeExecutor {
        fn new(latency_ms: u64) -> Self {
            Self {
                latency: Duration::from_millis(latency_ms),
                fail_hosts: HashSet::new(),
                calls: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent_seen: AtomicUsize::new(0),
                spans: Mutex::new(Vec::new()),
            }
        }

        fn failing(latency_ms: u64, hosts: &[&str]) -> Self {
            let mut executor = Self::new(latency_ms);
            executor.fail_hosts = hosts.iter().map(|host| host.to_string()).collect();
            executor
        }
    }

    impl ResetExecutor for FakeExecutor {
        fn reset_host(&self, target: &HostTarget, _progress: &ProgressSender) -> HostResetOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now_running = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent_seen
                .fetch_max(now_running, Ordering::SeqCst);

            let start = Instant::now();
            std::thread::sleep(self.latency);
            let end = Instant::now();

            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            self.spans
                .lock()
                .expect("span lock should not be poisoned")
                .push((target.label(), start, end));

            if self.fail_hosts.contains(&target.label()) {
                HostResetOutcome::failure(
                    "port-release",
                    crate::job::CODE_PORT_RELEASE_TIMEOUT,
                    "port 6443 still bound after 20 attempts",
                    String::new(),
                )
            } else {
                HostResetOutcome::Success(HostResetSuccess {
                    phases: Vec::new(),
                    raw_log: String::new(),
                })
            }
        }
    }

    #[derive(Default)]
    struct RecordingReporter {
        lines: Mutex<Vec<String>>,
    }

    impl RecordingReporter {
        fn lines(&self) -> Vec<String> {
            self.lines
                .lock()
                .expect("line lock should not be poisoned")
                .clone()
        }
    }

    impl Reporter for RecordingReporter {
        fn progress(&self, _event: &ProgressEvent) {}

        fn would_reset(&self, host: &str) {
            self.lines
                .lock()
                .expect("line lock should not be poisoned")
                .push(format!("would reset {host}"));
        }

        fn completion(&self, host: &str, outcome: &HostResetOutcome) {
            let verdict = if outcome.is_success() {
                "reset complete"
            } else {
                "reset failed"
            };
            self.lines
                .lock()
                .expect("line lock should not be poisoned")
                .push(format!("{host}: {verdict}"));
        }
    }

    fn targets(hosts: &[&str]) -> Vec<HostTarget> {
        hosts
            .iter()
            .map(|host| HostTarget::new("root", *host, 22))
            .collect()
    }

    fn options(dispatch: DispatchMode, dry_run: bool, max_concurrent: usize) -> RunOptions {
        RunOptions {
            dry_run,
            verbose: false,
            dispatch,
            max_concurrent,
        }
    }

    #[tokio::test]
    async fn serial_dispatch_runs_one_host_at_a_time_in_order() {
        let executor = Arc::new(FakeExecutor::new(30));
        let reporter = Arc::new(RecordingReporter::default());
        let plan = build_execution_plan(
            targets(&["a", "b", "c"]),
            options(DispatchMode::Serial, false, 1),
        );

        let report = run_fleet_reset(executor.clone(), plan, reporter).await;

        assert_eq!(report.summary.succeeded, 3);
        assert_eq!(executor.max_concurrent_seen.load(Ordering::SeqCst), 1);

        let spans = executor
            .spans
            .lock()
            .expect("span lock should not be poisoned")
            .clone();
        let order: Vec<&str> = spans.iter().map(|(host, _, _)| host.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        for pair in spans.windows(2) {
            assert!(
                pair[0].2 <= pair[1].1,
                "a later host must not start before the previous one completes"
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_dispatch_joins_every_host_before_returning() {
        let executor = Arc::new(FakeExecutor::new(40));
        let reporter = Arc::new(RecordingReporter::default());
        let plan = build_execution_plan(
            targets(&["a", "b", "c"]),
            options(DispatchMode::Parallel, false, 8),
        );

        let report = run_fleet_reset(executor.clone(), plan, reporter).await;

        // The join barrier: every job has completed by the time the report
        // exists.
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
        assert_eq!(report.results.len(), 3);
        assert!(report.summary.finished_at.is_some());
        let order: Vec<&str> = report
            .results
            .iter()
            .map(|result| result.host.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"], "results keep resolution order");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_dispatch_honors_the_concurrency_limit() {
        let executor = Arc::new(FakeExecutor::new(30));
        let reporter = Arc::new(RecordingReporter::default());
        let plan = build_execution_plan(
            targets(&["a", "b", "c", "d", "e", "f"]),
            options(DispatchMode::Parallel, false, 2),
        );

        let report = run_fleet_reset(executor.clone(), plan, reporter).await;

        assert_eq!(report.summary.succeeded, 6);
        assert!(executor.max_concurrent_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn dry_run_emits_ordered_lines_and_never_calls_the_executor() {
        let executor = Arc::new(FakeExecutor::new(0));
        let reporter = Arc::new(RecordingReporter::default());
        let plan = build_execution_plan(
            targets(&["a", "b", "c"]),
            options(DispatchMode::Parallel, true, 8),
        );

        let report = run_fleet_reset(executor.clone(), plan, reporter.clone()).await;

        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            reporter.lines(),
            vec!["would reset a", "would reset b", "would reset c"]
        );
        assert_eq!(report.summary.succeeded, 3);
        assert_eq!(exit_code_for(&report.summary), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failed_host_is_counted_and_drives_a_nonzero_exit() {
        let executor = Arc::new(FakeExecutor::failing(5, &["b"]));
        let reporter = Arc::new(RecordingReporter::default());
        let plan = build_execution_plan(
            targets(&["a", "b"]),
            options(DispatchMode::Parallel, false, 8),
        );

        let report = run_fleet_reset(executor, plan, reporter).await;

        assert_eq!(report.summary.succeeded, 1);
        assert_eq!(report.summary.failed, 1);
        assert_eq!(exit_code_for(&report.summary), 1);

        let failed = report
            .results
            .iter()
            .find(|result| result.host == "b")
            .expect("failed host should be reported");
        assert_eq!(failed.status, HostResetStatus::Failed);
        assert_eq!(
            failed.error_code.as_deref(),
            Some(crate::job::CODE_PORT_RELEASE_TIMEOUT)
        );
    }
}
