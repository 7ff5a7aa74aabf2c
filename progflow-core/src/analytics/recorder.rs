use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::analytics::bus::EventBus;
use crate::analytics::sink::TraceSink;
use crate::analytics::types::{ProgramAnalytics, RunSummary, TraceEvent, TraceEventKind};
use crate::programs::run::{FailureReason, RunStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingOptions {
    /// Keep aggregate metrics for the run.
    pub tracking: bool,
    /// Keep the full event list for the run.
    pub debug: bool,
}

impl RecordingOptions {
    fn is_enabled(self) -> bool {
        self.tracking || self.debug
    }
}

#[derive(Debug, Default)]
struct RunMetrics {
    completed: u64,
    skipped: u64,
    failed: u64,
    retries: u64,
    latency_total_ms: u64,
    latency_samples: u64,
    branches: BTreeMap<String, u64>,
    failed_steps: BTreeMap<String, u64>,
    event_count: u64,
}

impl RunMetrics {
    fn observe(&mut self, step_id: Option<&str>, kind: &TraceEventKind) {
        self.event_count += 1;
        match kind {
            TraceEventKind::StepCompleted {
                branch,
                duration_ms,
            } => {
                self.completed += 1;
                self.latency_total_ms += duration_ms;
                self.latency_samples += 1;
                *self.branches.entry(branch.clone()).or_default() += 1;
            }
            TraceEventKind::StepSkipped { branch, .. } => {
                self.skipped += 1;
                *self.branches.entry(branch.clone()).or_default() += 1;
            }
            TraceEventKind::StepFailed {
                branch,
                duration_ms,
                ..
            } => {
                self.failed += 1;
                self.latency_total_ms += duration_ms;
                self.latency_samples += 1;
                *self.branches.entry(branch.clone()).or_default() += 1;
                if let Some(step_id) = step_id {
                    *self.failed_steps.entry(step_id.to_owned()).or_default() += 1;
                }
            }
            TraceEventKind::StepRetried { .. } => self.retries += 1,
            _ => {}
        }
    }
}

#[derive(Debug)]
struct RunRecord {
    program_id: String,
    version: u32,
    options: RecordingOptions,
    next_sequence: u64,
    events: Vec<TraceEvent>,
    metrics: RunMetrics,
    status: Option<RunStatus>,
    failure_reason: Option<FailureReason>,
    elapsed_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct RecorderState {
    runs: HashMap<String, RunRecord>,
    order: VecDeque<String>,
}

impl RecorderState {
    /// Drops the oldest finished runs until at most `keep` remain. Runs that
    /// have not completed stay, so the table can exceed `keep` while they last.
    fn evict_finished(&mut self, keep: usize) {
        let mut index = 0;
        while self.order.len() > keep && index < self.order.len() {
            let finished = self
                .runs
                .get(&self.order[index])
                .map_or(true, |record| record.status.is_some());
            if !finished {
                index += 1;
                continue;
            }
            if let Some(evicted) = self.order.remove(index) {
                self.runs.remove(&evicted);
                debug!(run_id = %evicted, "evicted run from recorder");
            }
        }
    }
}

/// Collects run traces and metrics. Every method is infallible from the
/// caller's point of view; internal faults are logged and dropped.
pub struct DebugRecorder {
    state: RwLock<RecorderState>,
    max_retained_runs: usize,
    sink: Option<Arc<dyn TraceSink>>,
    bus: Option<EventBus>,
}

impl DebugRecorder {
    pub fn new(max_retained_runs: usize) -> Self {
        Self {
            state: RwLock::new(RecorderState::default()),
            max_retained_runs: max_retained_runs.max(1),
            sink: None,
            bus: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn begin_run(&self, run_id: &str, program_id: &str, version: u32, options: RecordingOptions) {
        if !options.is_enabled() {
            debug!(run_id, "recording disabled for run");
            return;
        }

        let Ok(mut state) = self.state.write() else {
            warn!(run_id, "recorder lock poisoned; run will not be recorded");
            return;
        };

        state.evict_finished(self.max_retained_runs - 1);

        state.order.push_back(run_id.to_owned());
        state.runs.insert(
            run_id.to_owned(),
            RunRecord {
                program_id: program_id.to_owned(),
                version,
                options,
                next_sequence: 1,
                events: Vec::new(),
                metrics: RunMetrics::default(),
                status: None,
                failure_reason: None,
                elapsed_ms: None,
            },
        );
    }

    /// Appends an event to the run's trace and returns its sequence number,
    /// or `None` when the run is not being recorded.
    pub fn record(
        &self,
        run_id: &str,
        step_id: Option<&str>,
        attempt: Option<u32>,
        kind: TraceEventKind,
    ) -> Option<u64> {
        let event = {
            let Ok(mut state) = self.state.write() else {
                warn!(run_id, event = kind.name(), "recorder lock poisoned; event dropped");
                return None;
            };
            let record = state.runs.get_mut(run_id)?;

            let sequence = record.next_sequence;
            record.next_sequence += 1;
            record.metrics.observe(step_id, &kind);
            if let TraceEventKind::RunCompleted {
                status,
                failure_reason,
                elapsed_ms,
            } = &kind
            {
                record.status = Some(*status);
                record.failure_reason = failure_reason.clone();
                record.elapsed_ms = Some(*elapsed_ms);
            }

            let event = TraceEvent {
                run_id: run_id.to_owned(),
                sequence,
                timestamp: Utc::now(),
                step_id: step_id.map(str::to_owned),
                attempt,
                kind,
            };
            if record.options.debug {
                record.events.push(event.clone());
            }
            event
        };

        if let Some(sink) = &self.sink {
            if let Err(err) = sink.write(&event) {
                warn!(run_id, sequence = event.sequence, "trace sink write failed: {err}");
            }
        }
        let sequence = event.sequence;
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
        Some(sequence)
    }

    /// Full event list of a retained run. Empty unless the run was recorded
    /// in debug mode.
    pub fn trace(&self, run_id: &str) -> Option<Vec<TraceEvent>> {
        let Ok(state) = self.state.read() else {
            warn!(run_id, "recorder lock poisoned; trace unavailable");
            return None;
        };
        state.runs.get(run_id).map(|record| record.events.clone())
    }

    pub fn summarize(&self, run_id: &str) -> Option<RunSummary> {
        let Ok(state) = self.state.read() else {
            warn!(run_id, "recorder lock poisoned; summary unavailable");
            return None;
        };
        let record = state.runs.get(run_id)?;
        let metrics = &record.metrics;
        let mean_step_latency_ms = if metrics.latency_samples == 0 {
            0.0
        } else {
            metrics.latency_total_ms as f64 / metrics.latency_samples as f64
        };

        Some(RunSummary {
            run_id: run_id.to_owned(),
            program_id: record.program_id.clone(),
            version: record.version,
            status: record.status,
            failure_reason: record.failure_reason.clone(),
            step_count: metrics.completed + metrics.skipped + metrics.failed,
            completed: metrics.completed,
            skipped: metrics.skipped,
            failed: metrics.failed,
            retries: metrics.retries,
            mean_step_latency_ms,
            branch_histogram: metrics.branches.clone(),
            event_count: metrics.event_count,
            elapsed_ms: record.elapsed_ms,
        })
    }

    pub fn program_analytics(&self, program_id: &str) -> ProgramAnalytics {
        let mut analytics = ProgramAnalytics {
            program_id: program_id.to_owned(),
            runs: 0,
            completed: 0,
            failed: 0,
            in_flight: 0,
            mean_run_duration_ms: 0.0,
            step_failures: BTreeMap::new(),
        };

        let Ok(state) = self.state.read() else {
            warn!(program_id, "recorder lock poisoned; analytics unavailable");
            return analytics;
        };

        let mut duration_total = 0u64;
        let mut duration_samples = 0u64;
        for record in state.runs.values().filter(|r| r.program_id == program_id) {
            analytics.runs += 1;
            match record.status {
                Some(RunStatus::Completed) => analytics.completed += 1,
                Some(RunStatus::Failed) => analytics.failed += 1,
                None => analytics.in_flight += 1,
            }
            if let Some(elapsed) = record.elapsed_ms {
                duration_total += elapsed;
                duration_samples += 1;
            }
            for (step_id, count) in &record.metrics.failed_steps {
                *analytics.step_failures.entry(step_id.clone()).or_default() += count;
            }
        }

        if duration_samples > 0 {
            analytics.mean_run_duration_ms = duration_total as f64 / duration_samples as f64;
        }
        analytics
    }

    pub fn retained_runs(&self) -> usize {
        self.state
            .read()
            .map(|state| state.order.len())
            .unwrap_or_default()
    }
}

impl Default for DebugRecorder {
    fn default() -> Self {
        Self::new(1_000)
    }
}

/// Recorder handle bound to one run.
#[derive(Clone)]
pub struct RunTracer {
    recorder: Arc<DebugRecorder>,
    run_id: Arc<str>,
}

impl RunTracer {
    pub fn new(recorder: Arc<DebugRecorder>, run_id: &str) -> Self {
        Self {
            recorder,
            run_id: Arc::from(run_id),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_event(&self, kind: TraceEventKind) {
        self.recorder.record(&self.run_id, None, None, kind);
    }

    pub fn step_event(&self, step_id: &str, attempt: u32, kind: TraceEventKind) {
        self.recorder
            .record(&self.run_id, Some(step_id), Some(attempt), kind);
    }

    /// Event for a step that was decided without being dispatched.
    pub fn pending_step_event(&self, step_id: &str, kind: TraceEventKind) {
        self.recorder.record(&self.run_id, Some(step_id), None, kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::programs::run::StepError;

    const DEBUG: RecordingOptions = RecordingOptions {
        tracking: true,
        debug: true,
    };
    const METRICS_ONLY: RecordingOptions = RecordingOptions {
        tracking: true,
        debug: false,
    };

    fn completed(branch: &str, duration_ms: u64) -> TraceEventKind {
        TraceEventKind::StepCompleted {
            branch: branch.to_owned(),
            duration_ms,
        }
    }

    struct FailingSink;

    impl TraceSink for FailingSink {
        fn write(&self, _event: &TraceEvent) -> std::io::Result<()> {
            Err(std::io::Error::other("disk full"))
        }
    }

    #[test]
    fn sequences_are_monotonic_per_run() {
        let recorder = DebugRecorder::new(10);
        recorder.begin_run("a", "p", 1, DEBUG);
        recorder.begin_run("b", "p", 1, DEBUG);

        assert_eq!(recorder.record("a", None, None, TraceEventKind::StepStarted), Some(1));
        assert_eq!(recorder.record("b", None, None, TraceEventKind::StepStarted), Some(1));
        assert_eq!(recorder.record("a", None, None, TraceEventKind::StepStarted), Some(2));

        let trace = recorder.trace("a").unwrap();
        assert_eq!(
            trace.iter().map(|e| e.sequence).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn summary_counts_outcomes_and_branches() {
        let recorder = DebugRecorder::new(10);
        recorder.begin_run("run", "p", 2, METRICS_ONLY);
        recorder.record("run", Some("a"), Some(1), completed("taken", 10));
        recorder.record("run", Some("b"), Some(1), completed("taken", 30));
        recorder.record(
            "run",
            Some("c"),
            None,
            TraceEventKind::StepSkipped {
                branch: "not_taken".to_owned(),
                reason: None,
            },
        );
        recorder.record(
            "run",
            Some("d"),
            Some(1),
            TraceEventKind::StepRetried {
                error: StepError::handler("boom"),
                next_delay_ms: 0,
            },
        );

        let summary = recorder.summarize("run").unwrap();
        assert_eq!(summary.step_count, 3);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.retries, 1);
        assert_eq!(summary.mean_step_latency_ms, 20.0);
        assert_eq!(summary.branch_histogram.get("taken"), Some(&2));
        assert_eq!(summary.branch_histogram.get("not_taken"), Some(&1));
        assert!(recorder.trace("run").unwrap().is_empty());
    }

    fn complete(recorder: &DebugRecorder, run_id: &str) {
        recorder.record(
            run_id,
            None,
            None,
            TraceEventKind::RunCompleted {
                status: RunStatus::Completed,
                failure_reason: None,
                elapsed_ms: 1,
            },
        );
    }

    #[test]
    fn retention_evicts_oldest_finished_runs() {
        let recorder = DebugRecorder::new(2);
        for run in ["r1", "r2", "r3"] {
            recorder.begin_run(run, "p", 1, METRICS_ONLY);
            complete(&recorder, run);
        }
        assert_eq!(recorder.retained_runs(), 2);
        assert!(recorder.summarize("r1").is_none());
        assert!(recorder.summarize("r3").is_some());
    }

    #[test]
    fn retention_keeps_runs_still_in_progress() {
        let recorder = DebugRecorder::new(1);
        recorder.begin_run("first", "p", 1, DEBUG);
        recorder.begin_run("second", "p", 1, DEBUG);

        assert_eq!(
            recorder.record("first", Some("a"), Some(1), TraceEventKind::StepStarted),
            Some(1)
        );
        complete(&recorder, "first");
        complete(&recorder, "second");
        assert_eq!(recorder.trace("first").unwrap().len(), 2);
        assert_eq!(recorder.summarize("first").unwrap().status, Some(RunStatus::Completed));

        recorder.begin_run("third", "p", 1, DEBUG);
        assert_eq!(recorder.retained_runs(), 1);
        assert!(recorder.summarize("first").is_none());
        assert!(recorder.summarize("second").is_none());
        assert!(recorder.summarize("third").is_some());
    }

    #[test]
    fn failing_sink_is_swallowed() {
        let recorder = DebugRecorder::new(4).with_sink(Arc::new(FailingSink));
        recorder.begin_run("run", "p", 1, DEBUG);
        assert_eq!(
            recorder.record("run", None, None, TraceEventKind::RunCancelled),
            Some(1)
        );
        assert_eq!(recorder.trace("run").unwrap().len(), 1);
    }

    #[test]
    fn disabled_runs_are_not_recorded() {
        let recorder = DebugRecorder::new(4);
        recorder.begin_run(
            "quiet",
            "p",
            1,
            RecordingOptions {
                tracking: false,
                debug: false,
            },
        );
        assert_eq!(
            recorder.record("quiet", None, None, TraceEventKind::RunCancelled),
            None
        );
        assert!(recorder.summarize("quiet").is_none());
    }

    #[test]
    fn program_analytics_aggregates_runs() {
        let recorder = DebugRecorder::new(10);
        for (run, status, elapsed) in [
            ("r1", RunStatus::Completed, 100),
            ("r2", RunStatus::Failed, 300),
        ] {
            recorder.begin_run(run, "onboarding", 1, METRICS_ONLY);
            if status == RunStatus::Failed {
                recorder.record(
                    run,
                    Some("send"),
                    Some(1),
                    TraceEventKind::StepFailed {
                        branch: "taken".to_owned(),
                        error: StepError::handler("smtp down"),
                        duration_ms: 5,
                    },
                );
            }
            recorder.record(
                run,
                None,
                None,
                TraceEventKind::RunCompleted {
                    status,
                    failure_reason: None,
                    elapsed_ms: elapsed,
                },
            );
        }
        recorder.begin_run("r3", "onboarding", 1, METRICS_ONLY);
        recorder.begin_run("other", "billing", 1, METRICS_ONLY);

        let analytics = recorder.program_analytics("onboarding");
        assert_eq!(analytics.runs, 3);
        assert_eq!(analytics.completed, 1);
        assert_eq!(analytics.failed, 1);
        assert_eq!(analytics.in_flight, 1);
        assert_eq!(analytics.mean_run_duration_ms, 200.0);
        assert_eq!(analytics.step_failures.get("send"), Some(&1));
    }

    #[tokio::test]
    async fn bus_subscribers_see_recorded_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let recorder = DebugRecorder::new(4).with_bus(bus);
        recorder.begin_run("run", "p", 1, METRICS_ONLY);
        recorder.record("run", Some("a"), Some(1), TraceEventKind::StepStarted);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.step_id.as_deref(), Some("a"));
        assert_eq!(event.kind.name(), "step_started");
    }
}
