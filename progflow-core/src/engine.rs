use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::analytics::{
    DebugRecorder, EventBus, FileTraceSink, ProgramAnalytics, RunEvents, RunSummary,
    TraceEvent,
};
use crate::config::{validate_config, EngineConfig};
use crate::error::{Error, Result};
use crate::integrations::{
    KnowledgeProvider, NoopKnowledgeProvider, NoopPersonalityProvider, PersonalityProvider,
};
use crate::programs::{
    BuiltinServices, EvaluationOptions, ExpressionEvaluator, HandlerRegistry, Program,
    ProgramCatalog, ProgramExecutor, ProgramLoader, RunContext, RunRequest, RunResult,
    StepDispatcher, ValidationIssue,
};

/// Optional collaborators for [`ProgramEngine::with_services`].
#[derive(Clone)]
pub struct EngineServices {
    pub knowledge: Arc<dyn KnowledgeProvider>,
    pub personality: Arc<dyn PersonalityProvider>,
    /// Replaces the built-in handler registry when set.
    pub registry: Option<HandlerRegistry>,
}

impl Default for EngineServices {
    fn default() -> Self {
        Self {
            knowledge: Arc::new(NoopKnowledgeProvider),
            personality: Arc::new(NoopPersonalityProvider),
            registry: None,
        }
    }
}

/// Where a submitted run currently stands.
#[derive(Debug, Clone)]
pub enum RunPhase {
    Running,
    Finished(Arc<RunResult>),
    Rejected(String),
}

impl RunPhase {
    pub fn is_running(&self) -> bool {
        matches!(self, RunPhase::Running)
    }
}

struct RunEntry {
    phase: RunPhase,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RunTable {
    entries: HashMap<String, RunEntry>,
    order: VecDeque<String>,
}

impl RunTable {
    fn insert(&mut self, run_id: &str, cancel: CancellationToken, max_retained: usize) {
        self.entries.insert(
            run_id.to_owned(),
            RunEntry {
                phase: RunPhase::Running,
                cancel,
            },
        );
        self.order.push_back(run_id.to_owned());
        self.evict(max_retained);
    }

    fn settle(&mut self, run_id: &str, phase: RunPhase) {
        if let Some(entry) = self.entries.get_mut(run_id) {
            entry.phase = phase;
        }
    }

    /// Drops the oldest settled runs once the table is over capacity.
    /// Running entries are never evicted.
    fn evict(&mut self, max_retained: usize) {
        let max_retained = max_retained.max(1);
        let mut index = 0;
        while self.entries.len() > max_retained && index < self.order.len() {
            let running = self
                .entries
                .get(&self.order[index])
                .is_some_and(|entry| entry.phase.is_running());
            if running {
                index += 1;
                continue;
            }
            if let Some(run_id) = self.order.remove(index) {
                self.entries.remove(&run_id);
            }
        }
    }
}

/// A run started in the background.
pub struct RunHandle {
    run_id: String,
    cancel: CancellationToken,
    task: JoinHandle<Result<RunResult>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn join(self) -> Result<RunResult> {
        self.task
            .await
            .map_err(|err| Error::Task(format!("run '{}': {err}", self.run_id)))?
    }
}

/// Owns the catalog, executor and recorder, and tracks runs it started.
pub struct ProgramEngine {
    config: EngineConfig,
    executor: ProgramExecutor,
    bus: EventBus,
    catalog: RwLock<ProgramCatalog>,
    runs: Arc<Mutex<RunTable>>,
}

impl ProgramEngine {
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        Self::with_services(config, EngineServices::default())
    }

    pub fn with_services(config: EngineConfig, services: EngineServices) -> Result<Self> {
        validate_config(&config)?;

        let bus = EventBus::new(config.recorder.event_buffer);
        let mut recorder =
            DebugRecorder::new(config.recorder.max_retained_runs).with_bus(bus.clone());
        if let Some(path) = &config.recorder.trace_file {
            recorder = recorder.with_sink(Arc::new(FileTraceSink::open(path)?));
        }

        let registry = match services.registry {
            Some(registry) => registry,
            None => HandlerRegistry::builtin(BuiltinServices {
                personality: services.personality.clone(),
                http: config.http.clone(),
            })?,
        };
        let evaluator = ExpressionEvaluator::with_options(EvaluationOptions {
            max_length: config.expressions.max_length,
            max_depth: config.expressions.max_depth,
        });

        let dispatcher = StepDispatcher::new(Arc::new(registry), Arc::new(evaluator))
            .with_knowledge(services.knowledge)
            .with_personality(services.personality)
            .with_knowledge_settings(config.knowledge.clone());
        let executor =
            ProgramExecutor::new(dispatcher, Arc::new(recorder), config.execution.clone());

        Ok(Self {
            config,
            executor,
            bus,
            catalog: RwLock::new(ProgramCatalog::new()),
            runs: Arc::new(Mutex::new(RunTable::default())),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        self.executor.dispatcher().registry()
    }

    pub fn recorder(&self) -> &Arc<DebugRecorder> {
        self.executor.recorder()
    }

    pub fn register_program(&self, program: Program) -> Result<()> {
        let mut catalog = self.catalog.write().unwrap_or_else(PoisonError::into_inner);
        catalog.register(program)
    }

    /// Registers every program found at `path` and returns how many were added.
    pub fn load_programs(&self, path: &Path) -> Result<usize> {
        let programs = ProgramLoader::load_path(path)?;
        let count = programs.len();
        for program in programs {
            self.register_program(program)?;
        }
        info!(path = %path.display(), count, "programs loaded");
        Ok(count)
    }

    pub fn publish(&self, program_id: &str, version: u32) -> Result<()> {
        let mut catalog = self.catalog.write().unwrap_or_else(PoisonError::into_inner);
        catalog.publish(program_id, version)
    }

    pub fn archive(&self, program_id: &str, version: u32) -> Result<()> {
        let mut catalog = self.catalog.write().unwrap_or_else(PoisonError::into_inner);
        catalog.archive(program_id, version)
    }

    pub fn resolve(&self, program_id: &str, version: Option<u32>) -> Result<Arc<Program>> {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        catalog.resolve(program_id, version)
    }

    pub fn programs(&self) -> Vec<String> {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        catalog.list()
    }

    pub fn validate(&self, program: &Program) -> Vec<ValidationIssue> {
        self.executor.validate(program)
    }

    /// Starts a catalog program in the background and returns its run id.
    pub fn execute(
        &self,
        program_id: &str,
        version: Option<u32>,
        request: RunRequest,
    ) -> Result<String> {
        let program = self.resolve(program_id, version)?;
        let handle = self.spawn(program, request)?;
        Ok(handle.run_id)
    }

    /// Starts `program` in the background.
    pub fn start(&self, program: &Program, request: RunRequest) -> Result<RunHandle> {
        self.spawn(Arc::new(program.clone()), request)
    }

    /// Starts `program` in the background with a subscription to its trace
    /// events that is open before the first event is recorded.
    pub fn start_following(
        &self,
        program: &Program,
        request: RunRequest,
    ) -> Result<(RunHandle, RunEvents)> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let events = self.bus.subscribe_run(run_id.clone());
        let handle = self.spawn_as(run_id, Arc::new(program.clone()), request)?;
        Ok((handle, events))
    }

    /// Runs `program` to completion.
    pub async fn run_program(&self, program: &Program, request: RunRequest) -> Result<RunResult> {
        self.start(program, request)?.join().await
    }

    fn spawn(&self, program: Arc<Program>, request: RunRequest) -> Result<RunHandle> {
        self.spawn_as(uuid::Uuid::new_v4().to_string(), program, request)
    }

    fn spawn_as(
        &self,
        run_id: String,
        program: Arc<Program>,
        request: RunRequest,
    ) -> Result<RunHandle> {
        let context = RunContext::from_request(run_id.clone(), &request, Utc::now())?;
        let cancel = CancellationToken::new();
        let max_retained = self.config.recorder.max_retained_runs;

        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(&run_id, cancel.clone(), max_retained);

        let executor = self.executor.clone();
        let runs = self.runs.clone();
        let task_run_id = run_id.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let outcome = executor.run(&program, context, task_cancel).await;
            let phase = match &outcome {
                Ok(result) => RunPhase::Finished(Arc::new(result.clone())),
                Err(err) => {
                    warn!(run_id = %task_run_id, program_id = %program.id, "run rejected: {err}");
                    RunPhase::Rejected(err.to_string())
                }
            };
            let mut table = runs.lock().unwrap_or_else(PoisonError::into_inner);
            table.settle(&task_run_id, phase);
            table.evict(max_retained);
            outcome
        });

        Ok(RunHandle {
            run_id,
            cancel,
            task,
        })
    }

    pub fn get_run(&self, run_id: &str) -> Option<RunPhase> {
        let table = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        table.entries.get(run_id).map(|entry| entry.phase.clone())
    }

    /// Requests cancellation of a running run. Returns false when the run is
    /// unknown or already settled.
    pub fn cancel(&self, run_id: &str) -> bool {
        let table = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
        match table.entries.get(run_id) {
            Some(entry) if entry.phase.is_running() => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn get_trace(&self, run_id: &str) -> Option<Vec<TraceEvent>> {
        self.recorder().trace(run_id)
    }

    pub fn summarize(&self, run_id: &str) -> Option<RunSummary> {
        self.recorder().summarize(run_id)
    }

    pub fn program_analytics(&self, program_id: &str) -> ProgramAnalytics {
        self.recorder().program_analytics(program_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TraceEvent> {
        self.bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::programs::{ActionType, RunStatus, Step, StepType, FailureReason};
    use serde_json::json;
    use std::time::Duration;

    fn greeting_program() -> Program {
        let mut program = Program {
            id: "welcome".to_owned(),
            steps: vec![
                Step::new("greet", StepType::Message, ActionType::SendMessage)
                    .with_params(json!({"message": "Hello ${user.name}"}))
                    .then("follow_up"),
                Step::new("follow_up", StepType::Task, ActionType::AssignTask)
                    .with_params(json!({"title": "Call back"})),
            ],
            ..Program::default()
        };
        program.analytics.store_debug_info = true;
        program
    }

    fn waiting_program() -> Program {
        Program {
            id: "patience".to_owned(),
            steps: vec![Step::new("pause", StepType::Wait, ActionType::Wait)
                .with_params(json!({"duration_seconds": 60}))],
            ..Program::default()
        }
    }

    async fn wait_settled(engine: &ProgramEngine, run_id: &str) -> RunPhase {
        loop {
            match engine.get_run(run_id) {
                Some(RunPhase::Running) | None => tokio::time::sleep(Duration::from_millis(5)).await,
                Some(phase) => return phase,
            }
        }
    }

    #[tokio::test]
    async fn run_program_renders_variables_and_records_trace() {
        let engine = ProgramEngine::from_config(EngineConfig::default()).unwrap();
        let request = RunRequest::for_tenant("acme").with_variable("user", json!({"name": "Ada"}));

        let result = engine.run_program(&greeting_program(), request).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.steps.len(), 2);
        assert_eq!(
            result.variables["steps"]["greet"]["content"],
            json!("Hello Ada")
        );
        let trace = engine.get_trace(&result.run_id).unwrap();
        assert_eq!(trace.first().unwrap().kind.name(), "run_started");
        assert_eq!(trace.last().unwrap().kind.name(), "run_completed");
        let summary = engine.summarize(&result.run_id).unwrap();
        assert_eq!(summary.completed, 2);
        assert!(matches!(
            engine.get_run(&result.run_id),
            Some(RunPhase::Finished(_))
        ));
    }

    #[tokio::test]
    async fn execute_resolves_catalog_programs() {
        let engine = ProgramEngine::from_config(EngineConfig::default()).unwrap();
        engine.register_program(greeting_program()).unwrap();
        engine.publish("welcome", 1).unwrap();

        let run_id = engine
            .execute("welcome", None, RunRequest::for_tenant("acme"))
            .unwrap();
        let RunPhase::Finished(result) = wait_settled(&engine, &run_id).await else {
            panic!("run should finish");
        };
        assert_eq!(result.program_id, "welcome");
        assert_eq!(engine.program_analytics("welcome").runs, 1);

        let missing = engine.execute("nope", None, RunRequest::default());
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn cancel_stops_a_running_program() {
        let engine = ProgramEngine::from_config(EngineConfig::default()).unwrap();
        engine.register_program(waiting_program()).unwrap();

        let run_id = engine
            .execute("patience", None, RunRequest::default())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine.cancel(&run_id));

        let RunPhase::Finished(result) = wait_settled(&engine, &run_id).await else {
            panic!("run should finish");
        };
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.failure_reason, Some(FailureReason::Cancelled));
        assert!(!engine.cancel(&run_id));
    }

    #[tokio::test]
    async fn invalid_programs_are_rejected() {
        let engine = ProgramEngine::from_config(EngineConfig::default()).unwrap();
        let mut program = greeting_program();
        program.steps[0].next = vec!["ghost".to_owned()];

        let handle = engine.start(&program, RunRequest::default()).unwrap();
        let run_id = handle.run_id().to_owned();
        let err = handle.join().await.unwrap_err();
        assert!(matches!(err, Error::InvalidProgram { .. }));
        assert!(matches!(engine.get_run(&run_id), Some(RunPhase::Rejected(_))));
        assert!(!engine.validate(&program).is_empty());
    }

    #[tokio::test]
    async fn following_a_run_sees_only_its_own_trace() {
        let engine = ProgramEngine::from_config(EngineConfig::default()).unwrap();
        let program = greeting_program();
        let request = RunRequest::for_tenant("acme").with_variable("user", json!({"name": "Ada"}));
        let other = engine.start(&program, request.clone()).unwrap();

        let (handle, mut events) = engine.start_following(&program, request).unwrap();
        assert_eq!(events.run_id(), handle.run_id());
        let result = handle.join().await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        other.join().await.unwrap();

        let mut followed = Vec::new();
        while let Some(event) = events.try_recv() {
            followed.push(event);
        }
        assert_eq!(followed.first().map(|event| event.kind.name()), Some("run_started"));
        assert!(followed.iter().all(|event| event.run_id == result.run_id));
        assert_eq!(followed, engine.get_trace(&result.run_id).unwrap());
    }

    #[tokio::test]
    async fn trace_file_receives_every_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("traces").join("events.jsonl");
        let mut config = EngineConfig::default();
        config.recorder.trace_file = Some(path.clone());
        let engine = ProgramEngine::from_config(config).unwrap();
        let mut events = engine.subscribe();

        let result = engine
            .run_program(&greeting_program(), RunRequest::default())
            .await
            .unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        let lines = written.lines().count();
        assert_eq!(lines, engine.get_trace(&result.run_id).unwrap().len());
        assert_eq!(events.recv().await.unwrap().kind.name(), "run_started");
    }

    #[test]
    fn run_table_keeps_running_entries_over_capacity() {
        let mut table = RunTable::default();
        table.insert("a", CancellationToken::new(), 1);
        table.insert("b", CancellationToken::new(), 1);
        assert_eq!(table.entries.len(), 2);

        table.settle("a", RunPhase::Rejected("boom".to_owned()));
        table.evict(1);
        assert!(!table.entries.contains_key("a"));
        assert!(table.entries.contains_key("b"));
    }
}
