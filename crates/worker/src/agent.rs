//! Worker agent control loop
//!
//! Registers once, then runs heartbeats and task polls on independent
//! timers until shutdown. At most one task runs at a time.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use agent_core::capabilities::{available_ram_mb, WorkerCapabilities};
use agent_core::client::{Heartbeat, WorkerStatus};
use agent_core::task::Task;
use agent_core::{AgentConfig, ControlPlane, OutputSink};
use agent_runner::{ExecutorError, RuntimeCapabilityProbe, TaskExecutor};
use task_bundle::{BundleError, WorkdirManager};

/// Lifecycle of the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Initializing,
    Registering,
    Idle,
    Executing,
    ShuttingDown,
    Terminated,
}

/// Errors that stop the agent
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Registration failed: {0}")]
    Registration(#[source] agent_core::Error),

    #[error("Failed to set up task execution: {0}")]
    Setup(#[from] ExecutorError),

    #[error("Failed to prepare work directory: {0}")]
    WorkDir(#[from] BundleError),
}

pub struct WorkerAgent<C> {
    config: AgentConfig,
    client: Arc<C>,
    executor: Arc<TaskExecutor>,
    capabilities: WorkerCapabilities,
    state: Arc<watch::Sender<AgentState>>,
    in_flight: Arc<AtomicBool>,
}

impl<C: ControlPlane + 'static> WorkerAgent<C> {
    pub fn new(config: AgentConfig, client: Arc<C>, executor: TaskExecutor, capabilities: WorkerCapabilities) -> Self {
        let (state, _) = watch::channel(AgentState::Initializing);
        Self {
            config,
            client,
            executor: Arc::new(executor),
            capabilities,
            state: Arc::new(state),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Probe the host and build everything the control loop needs
    pub async fn initialize(config: AgentConfig, client: Arc<C>) -> Result<Self, AgentError> {
        info!("Initializing worker agent, work dir {:?}", config.work_dir);
        WorkdirManager::new(&config.work_dir).ensure_root().await?;

        let runtimes = RuntimeCapabilityProbe::default().detect_all().await;
        let capabilities = WorkerCapabilities::detect(&config, runtimes.clone()).await;
        info!(
            "Worker {} on {} ({} cores, {} MiB RAM)",
            capabilities.identity.stable_id,
            capabilities.identity.hostname,
            capabilities.resources.cpu_cores,
            capabilities.resources.ram_total
        );

        let executor = TaskExecutor::from_agent_config(&config, Arc::new(runtimes))?;
        Ok(Self::new(config, client, executor, capabilities))
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    pub fn capabilities(&self) -> &WorkerCapabilities {
        &self.capabilities
    }

    /// Register and serve until `shutdown` is cancelled
    ///
    /// A task still running at shutdown is not cancelled; it is abandoned
    /// when the process exits.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), AgentError> {
        self.state.send_replace(AgentState::Registering);
        let worker_id = match self.client.register(&self.capabilities).await {
            Ok(worker_id) => worker_id,
            Err(e) => {
                error!("Registration failed: {}", e);
                self.state.send_replace(AgentState::Terminated);
                return Err(AgentError::Registration(e));
            }
        };
        info!("Registered as worker {}", worker_id);
        self.state.send_replace(AgentState::Idle);

        let agent = Arc::new(self);
        let worker_id: Arc<str> = worker_id.into();
        let heartbeats = tokio::spawn(Arc::clone(&agent).heartbeat_loop(shutdown.clone()));
        let polls = tokio::spawn(Arc::clone(&agent).poll_loop(Arc::clone(&worker_id), shutdown.clone()));

        shutdown.cancelled().await;
        // Both loops race their in-flight call against the token
        let (heartbeats, polls) = tokio::join!(heartbeats, polls);
        if let Err(e) = heartbeats.and(polls) {
            warn!("Agent loop ended abnormally: {}", e);
        }

        agent.state.send_replace(AgentState::ShuttingDown);
        info!("Shutting down worker {}", worker_id);
        agent.send_heartbeat(WorkerStatus::Offline).await;
        tokio::time::sleep(agent.config.shutdown_grace).await;

        if agent.in_flight.load(Ordering::SeqCst) {
            warn!("Exiting with a task still in flight");
        }
        agent.state.send_replace(AgentState::Terminated);
        Ok(())
    }

    async fn heartbeat_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.send_heartbeat(self.current_status()) => {}
            }
        }
    }

    async fn poll_loop(self: Arc<Self>, worker_id: Arc<str>, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.poll_once(&worker_id) => {}
            }
        }
    }

    fn current_status(&self) -> WorkerStatus {
        if self.in_flight.load(Ordering::SeqCst) {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Online
        }
    }

    async fn send_heartbeat(&self, status: WorkerStatus) {
        let heartbeat = Heartbeat {
            mac_address: self.capabilities.identity.mac_address.clone(),
            ram_available: available_ram_mb(),
            status,
        };
        match self.client.heartbeat(&heartbeat).await {
            Ok(()) => debug!("Heartbeat sent ({:?})", status),
            Err(e) => debug!("Heartbeat failed: {}", e),
        }
    }

    async fn poll_once(&self, worker_id: &str) {
        if self.in_flight.load(Ordering::SeqCst) {
            debug!("Task in flight, skipping poll");
            return;
        }

        match self.client.next_task(worker_id).await {
            Ok(Some(task)) => self.dispatch(task, worker_id),
            Ok(None) => debug!("No task available"),
            Err(e) => debug!("Poll failed: {}", e),
        }
    }

    fn dispatch(&self, task: Task, worker_id: &str) {
        let Some(guard) = InFlightGuard::acquire(&self.in_flight, &self.state) else {
            warn!("Received task {} while another is in flight, ignoring", task.id);
            return;
        };
        info!("Received task {}", task.id);

        let client = Arc::clone(&self.client);
        let executor = Arc::clone(&self.executor);
        let worker_id = worker_id.to_string();
        tokio::spawn(async move {
            let _guard = guard;
            process_task(client, &executor, &worker_id, &task).await;
        });
    }
}

/// Execute one task and send exactly one completion or failure report
async fn process_task<C: ControlPlane + 'static>(client: Arc<C>, executor: &TaskExecutor, worker_id: &str, task: &Task) {
    let sink: Arc<dyn OutputSink> = client.clone();
    let outcome = AssertUnwindSafe(executor.execute(task, Some(sink)))
        .catch_unwind()
        .await;

    let report = match outcome {
        Ok(Ok(result)) => client.complete_task(&task.id, worker_id, &result).await,
        Ok(Err(e)) => client.fail_task(&task.id, worker_id, &e.to_string()).await,
        Err(_) => {
            error!("Task {} panicked during execution", task.id);
            client
                .fail_task(&task.id, worker_id, "Task execution panicked")
                .await
        }
    };

    match report {
        Ok(()) => debug!("Reported result of task {}", task.id),
        Err(e) => error!("Failed to report result of task {}: {}", task.id, e),
    }
}

/// Holds the single-task gate; releasing it happens on drop, so a failed
/// report or a panic cannot leave the agent stuck busy
struct InFlightGuard {
    flag: Arc<AtomicBool>,
    state: Arc<watch::Sender<AgentState>>,
}

impl InFlightGuard {
    fn acquire(flag: &Arc<AtomicBool>, state: &Arc<watch::Sender<AgentState>>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()?;
        state.send_if_modified(|s| transition(s, AgentState::Idle, AgentState::Executing));
        Some(Self {
            flag: Arc::clone(flag),
            state: Arc::clone(state),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
        self.state
            .send_if_modified(|s| transition(s, AgentState::Executing, AgentState::Idle));
    }
}

fn transition(state: &mut AgentState, from: AgentState, to: AgentState) -> bool {
    if *state == from {
        *state = to;
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::client::OutputChunk;
    use agent_core::task::ExecutionResult;
    use agent_core::{Error as CoreError, Result as CoreResult, RuntimeInfo, RuntimeMap};
    use agent_runner::ExecutorConfig;
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde_json::json;
    use std::io::Write;
    use std::collections::VecDeque;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};
    use task_bundle::BundleMaterializer;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Register,
        Heartbeat(WorkerStatus),
        NextTask,
        Output(usize),
        Complete { task_id: String, output: String },
        Fail { task_id: String, message: String },
    }

    /// In-memory control plane recording every call
    #[derive(Default)]
    struct FakePlane {
        tasks: Mutex<VecDeque<Task>>,
        calls: Mutex<Vec<Call>>,
        reject_registration: bool,
        fail_reports: bool,
        fail_output: bool,
        /// How long `next_task` hangs before answering
        poll_delay: Option<Duration>,
        outstanding: AtomicBool,
        overlapping_polls: AtomicUsize,
    }

    impl FakePlane {
        fn with_tasks(tasks: Vec<Task>) -> Self {
            Self {
                tasks: Mutex::new(tasks.into()),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }

        fn reports(&self) -> Vec<Call> {
            self.calls()
                .into_iter()
                .filter(|c| matches!(c, Call::Complete { .. } | Call::Fail { .. }))
                .collect()
        }

        fn report(&self, call: Call) -> CoreResult<()> {
            self.record(call);
            self.outstanding.store(false, Ordering::SeqCst);
            if self.fail_reports {
                return Err(CoreError::Api {
                    status: 500,
                    message: "database unavailable".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl OutputSink for FakePlane {
        async fn send_output(&self, _task_id: &str, chunks: &[OutputChunk]) -> CoreResult<()> {
            self.record(Call::Output(chunks.len()));
            if self.fail_output {
                return Err(CoreError::Api {
                    status: 503,
                    message: "output ingestion paused".into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ControlPlane for FakePlane {
        async fn register(&self, _capabilities: &WorkerCapabilities) -> CoreResult<String> {
            self.record(Call::Register);
            if self.reject_registration {
                return Err(CoreError::Registration("worker quota exceeded".into()));
            }
            Ok("w-1".to_string())
        }

        async fn heartbeat(&self, heartbeat: &Heartbeat) -> CoreResult<()> {
            self.record(Call::Heartbeat(heartbeat.status));
            Ok(())
        }

        async fn next_task(&self, worker_id: &str) -> CoreResult<Option<Task>> {
            assert_eq!(worker_id, "w-1");
            self.record(Call::NextTask);
            if let Some(delay) = self.poll_delay {
                tokio::time::sleep(delay).await;
            }
            if self.outstanding.load(Ordering::SeqCst) {
                self.overlapping_polls.fetch_add(1, Ordering::SeqCst);
            }
            let task = self.tasks.lock().unwrap().pop_front();
            if task.is_some() {
                self.outstanding.store(true, Ordering::SeqCst);
            }
            Ok(task)
        }

        async fn complete_task(&self, task_id: &str, _worker_id: &str, result: &ExecutionResult) -> CoreResult<()> {
            self.report(Call::Complete {
                task_id: task_id.to_string(),
                output: result.output.clone(),
            })
        }

        async fn fail_task(&self, task_id: &str, _worker_id: &str, error_message: &str) -> CoreResult<()> {
            self.report(Call::Fail {
                task_id: task_id.to_string(),
                message: error_message.to_string(),
            })
        }
    }

    async fn agent(plane: &Arc<FakePlane>, root: &Path) -> WorkerAgent<FakePlane> {
        let config = AgentConfig {
            heartbeat_interval: Duration::from_millis(25),
            poll_interval: Duration::from_millis(20),
            shutdown_grace: Duration::from_millis(10),
            work_dir: root.to_path_buf(),
            ..AgentConfig::default()
        };
        let executor = TaskExecutor::new(
            ExecutorConfig {
                echo_output: false,
                ..Default::default()
            },
            BundleMaterializer::new(WorkdirManager::new(root), Duration::from_secs(5)).unwrap(),
            Arc::new(runtimes_with_sh_python()),
        );
        let capabilities = WorkerCapabilities::detect(&config, RuntimeMap::new()).await;
        WorkerAgent::new(config, Arc::clone(plane), executor, capabilities)
    }

    async fn wait_until(plane: &FakePlane, done: impl Fn(&[Call]) -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !done(&plane.calls()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    /// `sh` stands in for the python interpreter
    fn runtimes_with_sh_python() -> RuntimeMap {
        let mut runtimes = RuntimeMap::new();
        runtimes.insert("python".into(), RuntimeInfo::available("3.12.0", "sh"));
        runtimes
    }

    fn script_task(id: &str, main: &str) -> Task {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            writer
                .start_file("main.py", zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(main.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        Task::new(id)
            .with_runtime("python")
            .with_code_base64(STANDARD.encode(cursor.into_inner()))
    }

    fn shell_task(id: &str, command: &str) -> Task {
        Task::new(id).with_execution_config(json!({ "command": command }))
    }

    #[tokio::test]
    async fn test_registration_rejected_stops_agent() {
        let root = TempDir::new().unwrap();
        let plane = Arc::new(FakePlane {
            reject_registration: true,
            ..Default::default()
        });
        let agent = agent(&plane, root.path()).await;
        let state = agent.subscribe();

        let err = agent.run(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, AgentError::Registration(_)));
        assert_eq!(plane.calls(), vec![Call::Register]);
        assert_eq!(*state.borrow(), AgentState::Terminated);
    }

    #[tokio::test]
    async fn test_task_completed_once_then_offline() {
        let root = TempDir::new().unwrap();
        let plane = Arc::new(FakePlane::with_tasks(vec![shell_task("t1", "echo '  hi  '")]));
        let agent = agent(&plane, root.path()).await;
        let state = agent.subscribe();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(agent.run(shutdown.clone()));

        wait_until(&plane, |calls| calls.iter().any(|c| matches!(c, Call::Complete { .. }))).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(
            plane.reports(),
            vec![Call::Complete {
                task_id: "t1".into(),
                output: "hi".into()
            }]
        );
        assert_eq!(plane.calls().first(), Some(&Call::Register));
        assert_eq!(plane.calls().last(), Some(&Call::Heartbeat(WorkerStatus::Offline)));
        assert_eq!(*state.borrow(), AgentState::Terminated);
    }

    #[tokio::test]
    async fn test_failed_task_reported_once() {
        let root = TempDir::new().unwrap();
        let plane = Arc::new(FakePlane::with_tasks(vec![Task::new("empty")]));
        let agent = agent(&plane, root.path()).await;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(agent.run(shutdown.clone()));

        wait_until(&plane, |calls| calls.iter().any(|c| matches!(c, Call::Fail { .. }))).await;
        // Give further polls a chance to misbehave
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let reports = plane.reports();
        assert_eq!(reports.len(), 1);
        match &reports[0] {
            Call::Fail { task_id, message } => {
                assert_eq!(task_id, "empty");
                assert!(message.contains("no executable content"));
            }
            other => panic!("unexpected report {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_polling_while_busy() {
        let root = TempDir::new().unwrap();
        let plane = Arc::new(FakePlane::with_tasks(vec![shell_task("slow", "sleep 0.3; echo slow")]));
        let agent = agent(&plane, root.path()).await;
        let mut state = agent.subscribe();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(agent.run(shutdown.clone()));

        state.wait_for(|s| *s == AgentState::Executing).await.unwrap();
        wait_until(&plane, |calls| calls.iter().any(|c| matches!(c, Call::Complete { .. }))).await;
        state.wait_for(|s| *s == AgentState::Idle).await.unwrap();
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(plane.overlapping_polls.load(Ordering::SeqCst), 0);
        assert!(plane.calls().contains(&Call::Heartbeat(WorkerStatus::Busy)));
    }

    #[tokio::test]
    async fn test_report_failure_releases_gate() {
        let root = TempDir::new().unwrap();
        let plane = Arc::new(FakePlane {
            fail_reports: true,
            ..FakePlane::with_tasks(vec![shell_task("first", "echo 1"), shell_task("second", "echo 2")])
        });
        let agent = agent(&plane, root.path()).await;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(agent.run(shutdown.clone()));

        wait_until(&plane, |calls| {
            calls
                .iter()
                .any(|c| matches!(c, Call::Complete { task_id, .. } if task_id == "second"))
        })
        .await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(plane.reports().len(), 2);
    }

    #[tokio::test]
    async fn test_slow_poll_does_not_block_heartbeats_or_shutdown() {
        let root = TempDir::new().unwrap();
        let plane = Arc::new(FakePlane {
            poll_delay: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let agent = agent(&plane, root.path()).await;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(agent.run(shutdown.clone()));

        wait_until(&plane, |calls| calls.contains(&Call::NextTask)).await;
        let heartbeats = |calls: &[Call]| {
            calls
                .iter()
                .filter(|c| matches!(c, Call::Heartbeat(WorkerStatus::Online)))
                .count()
        };
        let before = heartbeats(&plane.calls());
        wait_until(&plane, |calls| heartbeats(calls) >= before + 3).await;

        let started = Instant::now();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("shutdown did not wait for the hung poll")
            .unwrap()
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(plane.calls().last(), Some(&Call::Heartbeat(WorkerStatus::Offline)));
    }

    #[tokio::test]
    async fn test_output_failures_still_complete_once() {
        let root = TempDir::new().unwrap();
        let plane = Arc::new(FakePlane {
            fail_output: true,
            ..FakePlane::with_tasks(vec![script_task("noisy", "for i in 1 2 3 4 5 6 7; do echo line $i; done\n")])
        });
        let agent = agent(&plane, root.path()).await;
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(agent.run(shutdown.clone()));

        wait_until(&plane, |calls| calls.iter().any(|c| matches!(c, Call::Complete { .. }))).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();

        let reports = plane.reports();
        assert_eq!(reports.len(), 1);
        match &reports[0] {
            Call::Complete { task_id, output } => {
                assert_eq!(task_id, "noisy");
                assert!(output.starts_with("line 1"));
                assert!(output.ends_with("line 7"));
            }
            other => panic!("unexpected report {:?}", other),
        }
        assert!(plane.calls().iter().any(|c| matches!(c, Call::Output(_))));
    }
}
