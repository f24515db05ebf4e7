//! The stack engine: lifecycle, scheduling, and result aggregation.
//!
//! `Submit` validates a spec, resolves its images, and builds the DAG.
//! `Execute` drives the graph with a bounded worker pool: ready nodes run
//! concurrently, each completion re-evaluates successors, and the run ends
//! when every node is terminal. The per-stack DAG lock is held only for
//! state transitions, never across I/O.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::context::{StackContext, INPUT_KEY};
use crate::dag::Dag;
use crate::error::{EngineError, RuntimeError};
use crate::image::{ImageError, ImageStore};
use crate::memory::MemoryStore;
use crate::runtime::{AgentRuntime, InvokeRequest, ModelRuntime, ProcessRuntime};
use crate::shim::ModelShim;
use crate::spec::validate_stack_spec;
use crate::state::StateStore;
use crate::types::{
    AgentDefinition, AgentOutput, ImageRef, NodeError, NodeErrorKind, NodeReport, NodeState,
    StackResult, StackSpec, StackStatus,
};

/// Per-submission overrides; unset fields fall back to [`EngineConfig`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub max_workers: Option<usize>,
    pub fail_fast: Option<bool>,
    pub node_timeout: Option<Duration>,
    pub cancel_grace: Option<Duration>,
}

#[derive(Debug, Clone)]
struct RunOptions {
    max_workers: Option<usize>,
    fail_fast: bool,
    node_timeout: Duration,
    cancel_grace: Duration,
}

/// Progress events observable while a stack executes.
#[derive(Debug, Clone)]
pub enum RunEvent {
    NodeStateChanged { id: String, state: NodeState },
    RunFinished { status: StackStatus },
}

/// Snapshot returned by `Inspect`.
#[derive(Debug, Clone)]
pub struct StackInspection {
    pub stack_id: String,
    pub name: String,
    pub nodes: Vec<NodeReport>,
    /// Edges as (predecessor, successor, data_flow).
    pub edges: Vec<(String, String, bool)>,
}

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct StackRun {
    id: String,
    name: String,
    dag: Mutex<Dag>,
    context: StackContext,
    cancel: CancellationToken,
    options: RunOptions,
    events: broadcast::Sender<RunEvent>,
    executed: AtomicBool,
}

impl StackRun {
    fn emit(&self, event: RunEvent) {
        let _ = self.events.send(event);
    }

    fn emit_state(&self, id: &str, state: NodeState) {
        self.emit(RunEvent::NodeStateChanged {
            id: id.to_string(),
            state,
        });
    }
}

/// Everything a node task needs, captured under the scheduler's lock.
struct NodeLaunch {
    index: usize,
    id: String,
    session_id: String,
    definition: Arc<AgentDefinition>,
    params: HashMap<String, Value>,
}

/// What one node task reports back to the scheduler.
enum StepOutcome {
    Success(AgentOutput),
    Failed(NodeError),
    Timeout,
    Cancelled,
}

pub struct StackEngine {
    images: Arc<ImageStore>,
    state: Arc<dyn StateStore>,
    memory: Arc<dyn MemoryStore>,
    model_runtime: Arc<dyn AgentRuntime>,
    process_runtime: Arc<dyn AgentRuntime>,
    config: EngineConfig,
    runs: Arc<RwLock<HashMap<String, Arc<StackRun>>>>,
}

#[derive(Default)]
pub struct StackEngineBuilder {
    images: Option<Arc<ImageStore>>,
    state: Option<Arc<dyn StateStore>>,
    memory: Option<Arc<dyn MemoryStore>>,
    shim: Option<Arc<dyn ModelShim>>,
    config: Option<EngineConfig>,
}

impl StackEngineBuilder {
    pub fn with_image_store(mut self, images: Arc<ImageStore>) -> Self {
        self.images = Some(images);
        self
    }

    pub fn with_state_store(mut self, state: Arc<dyn StateStore>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_memory_store(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_shim(mut self, shim: Arc<dyn ModelShim>) -> Self {
        self.shim = Some(shim);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> anyhow::Result<StackEngine> {
        let images = self
            .images
            .ok_or_else(|| anyhow::anyhow!("image store is required"))?;
        let state = self
            .state
            .ok_or_else(|| anyhow::anyhow!("state store is required"))?;
        let memory = self
            .memory
            .ok_or_else(|| anyhow::anyhow!("memory store is required"))?;
        let shim = self
            .shim
            .ok_or_else(|| anyhow::anyhow!("model shim is required"))?;
        let config = self.config.unwrap_or_default();

        let model_runtime = Arc::new(ModelRuntime::new(
            shim,
            state.clone(),
            memory.clone(),
            config.shim_attempts,
        ));
        let process_runtime = Arc::new(ProcessRuntime::new(state.clone()));

        Ok(StackEngine {
            images,
            state,
            memory,
            model_runtime,
            process_runtime,
            config,
            runs: Arc::new(RwLock::new(HashMap::new())),
        })
    }
}

impl StackEngine {
    pub fn builder() -> StackEngineBuilder {
        StackEngineBuilder::default()
    }

    pub fn state_store(&self) -> Arc<dyn StateStore> {
        self.state.clone()
    }

    pub fn memory_store(&self) -> Arc<dyn MemoryStore> {
        self.memory.clone()
    }

    /// Validate a spec, resolve its images, build the DAG, and register
    /// the run. Returns the stack id used by the other operations.
    pub async fn submit(
        &self,
        spec: StackSpec,
        inputs: Value,
        options: ExecuteOptions,
    ) -> Result<String, EngineError> {
        validate_stack_spec(&spec)?;

        let mut definitions: HashMap<String, Arc<AgentDefinition>> = HashMap::new();
        for agent in &spec.agents {
            let reference = ImageRef::parse(&agent.uses)
                .map_err(|e| EngineError::Resolution(e.to_string()))?;
            // Resolution is an idempotent read: one retry on io failure.
            let resolved = match self.images.resolve(&reference).await {
                Err(ImageError::Io(e)) => {
                    tracing::warn!("image store read failed ({}), retrying once", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    self.images.resolve(&reference).await
                }
                other => other,
            };
            let definition = resolved.map_err(|e| match e {
                ImageError::NotFound(_) => {
                    EngineError::Resolution(format!("{} (agent {:?})", reference, agent.id))
                }
                ImageError::Malformed { message, .. } => EngineError::Resolution(format!(
                    "{} (agent {:?}): {}",
                    reference, agent.id, message
                )),
                ImageError::Io(e) => EngineError::Backend(e.to_string()),
            })?;
            definitions.insert(agent.id.clone(), Arc::new(definition));
        }

        let dag = Dag::build(&spec, &definitions)?;

        let context = StackContext::new();
        if !inputs.is_null() {
            context
                .publish(INPUT_KEY, AgentOutput::from_value(inputs))
                .await
                .map_err(|e| EngineError::Internal(e.to_string()))?;
        }

        let options = RunOptions {
            max_workers: options.max_workers.or(self.config.max_workers),
            fail_fast: options.fail_fast.unwrap_or(self.config.fail_fast),
            node_timeout: options
                .node_timeout
                .unwrap_or(Duration::from_secs(self.config.node_timeout_secs)),
            cancel_grace: options
                .cancel_grace
                .unwrap_or(Duration::from_secs(self.config.cancel_grace_secs)),
        };

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let run = Arc::new(StackRun {
            id: uuid::Uuid::new_v4().to_string(),
            name: spec.name.clone(),
            dag: Mutex::new(dag),
            context,
            cancel: CancellationToken::new(),
            options,
            events,
            executed: AtomicBool::new(false),
        });

        let id = run.id.clone();
        tracing::info!(stack = %spec.name, stack_id = %id, agents = spec.agents.len(), "stack submitted");
        let mut runs = self.runs.write().await;
        runs.insert(id.clone(), run);
        Ok(id)
    }

    /// Parse a YAML spec and submit it.
    pub async fn submit_bytes(
        &self,
        bytes: &[u8],
        inputs: Value,
        options: ExecuteOptions,
    ) -> Result<String, EngineError> {
        let spec = crate::spec::load_stack_spec(bytes)?;
        self.submit(spec, inputs, options).await
    }

    async fn run(&self, stack_id: &str) -> Result<Arc<StackRun>, EngineError> {
        let runs = self.runs.read().await;
        runs.get(stack_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(stack_id.to_string()))
    }

    /// Observe run events. Subscribe before calling `execute` to see every
    /// transition.
    pub async fn subscribe(
        &self,
        stack_id: &str,
    ) -> Result<broadcast::Receiver<RunEvent>, EngineError> {
        Ok(self.run(stack_id).await?.events.subscribe())
    }

    pub async fn inspect(&self, stack_id: &str) -> Result<StackInspection, EngineError> {
        let run = self.run(stack_id).await?;
        let dag = run.dag.lock().await;
        Ok(StackInspection {
            stack_id: run.id.clone(),
            name: run.name.clone(),
            nodes: dag.reports(),
            edges: dag.edges(),
        })
    }

    /// Request cancellation. Running nodes observe it through their
    /// cancellation handles; the active `execute` drives the shutdown.
    pub async fn cancel(&self, stack_id: &str) -> Result<(), EngineError> {
        let run = self.run(stack_id).await?;
        tracing::info!(stack_id, "cancellation requested");
        run.cancel.cancel();
        Ok(())
    }

    /// Run the stack to a terminal state and aggregate the result.
    /// Each submitted stack executes exactly once.
    pub async fn execute(&self, stack_id: &str) -> Result<StackResult, EngineError> {
        let run = self.run(stack_id).await?;
        if run.executed.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Internal(format!(
                "stack {} was already executed",
                stack_id
            )));
        }

        let total = {
            let dag = run.dag.lock().await;
            dag.len()
        };
        let workers = run.options.max_workers.unwrap_or_else(|| {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            cpus.min(total).max(1)
        });
        tracing::debug!(stack_id, total, workers, "starting execution");

        let semaphore = Arc::new(Semaphore::new(workers));
        let (done_tx, mut done_rx) = mpsc::channel::<(usize, StepOutcome)>(total.max(1));
        // Ready nodes wait here in declaration order until a worker slot
        // frees up; the scheduler acquires the permit itself so dispatch
        // order is deterministic.
        let mut dispatch_queue: std::collections::VecDeque<NodeLaunch> =
            std::collections::VecDeque::new();
        let mut in_flight = 0usize;
        let mut cancel_requested = run.cancel.is_cancelled();
        let mut grace_deadline: Option<tokio::time::Instant> =
            cancel_requested.then(|| tokio::time::Instant::now() + run.options.cancel_grace);

        loop {
            // Cancellation may fire between channel receives (fail-fast,
            // external Cancel); stop dispatching as soon as it is visible.
            if !cancel_requested && run.cancel.is_cancelled() {
                cancel_requested = true;
                grace_deadline = Some(tokio::time::Instant::now() + run.options.cancel_grace);
            }

            if !cancel_requested {
                let launches: Vec<NodeLaunch> = {
                    let mut dag = run.dag.lock().await;
                    let ready = dag.promote_ready();
                    ready
                        .into_iter()
                        .map(|index| {
                            let node = dag.node(index);
                            NodeLaunch {
                                index,
                                id: node.spec.id.clone(),
                                session_id: format!("{}:{}", run.name, node.spec.id),
                                definition: node.definition.clone(),
                                params: node.spec.params.clone(),
                            }
                        })
                        .collect()
                };
                for launch in launches {
                    run.emit_state(&launch.id, NodeState::Ready);
                    dispatch_queue.push_back(launch);
                }

                while !dispatch_queue.is_empty() {
                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        break;
                    };
                    let launch = dispatch_queue.pop_front().expect("checked non-empty");
                    self.spawn_node(run.clone(), launch, permit, done_tx.clone());
                    in_flight += 1;
                }
            }

            if in_flight == 0 {
                let mut dag = run.dag.lock().await;
                if dag.all_terminal() {
                    break;
                }
                if cancel_requested {
                    cancel_remaining(&run, &mut dag, false);
                    break;
                }
                // Unreachable when the skip policy is correct: a stalled
                // non-terminal node would mean a dependency the failure
                // path forgot to resolve.
                return Err(EngineError::Internal(
                    "scheduler stalled with non-terminal nodes".to_string(),
                ));
            }

            let received = if cancel_requested {
                let deadline = grace_deadline.expect("set when cancellation observed");
                match tokio::time::timeout_at(deadline, done_rx.recv()).await {
                    Ok(received) => received,
                    Err(_) => {
                        // Grace period expired: abandon unresponsive nodes.
                        let mut dag = run.dag.lock().await;
                        cancel_remaining(&run, &mut dag, true);
                        break;
                    }
                }
            } else {
                tokio::select! {
                    received = done_rx.recv() => received,
                    _ = run.cancel.cancelled() => {
                        cancel_requested = true;
                        grace_deadline =
                            Some(tokio::time::Instant::now() + run.options.cancel_grace);
                        continue;
                    }
                }
            };

            let Some((index, outcome)) = received else {
                return Err(EngineError::Internal(
                    "completion channel closed unexpectedly".to_string(),
                ));
            };
            in_flight -= 1;
            self.apply_outcome(&run, index, outcome).await;
        }

        let result = self.aggregate(&run, cancel_requested).await;
        run.emit(RunEvent::RunFinished {
            status: result.status,
        });
        tracing::info!(stack_id, status = ?result.status, "stack finished");
        Ok(result)
    }

    /// Fold one node's outcome into the graph under the stack lock and
    /// resolve the consequences for its successors.
    async fn apply_outcome(&self, run: &Arc<StackRun>, index: usize, outcome: StepOutcome) {
        // Publication happens before the Completed transition so successors
        // promoted afterwards always find their inputs.
        let outcome = match outcome {
            StepOutcome::Success(output) => {
                let (id, output_key) = {
                    let dag = run.dag.lock().await;
                    let node = dag.node(index);
                    (node.spec.id.clone(), node.spec.output_key.clone())
                };
                match run.context.publish(&id, output.clone()).await {
                    Ok(()) => {
                        if let Some(key) = output_key {
                            if let Err(e) = run.context.publish(&key, output).await {
                                tracing::warn!(node = %id, "output key collision: {}", e);
                            }
                        }
                        StepOutcome::Success(AgentOutput::default())
                    }
                    Err(e) => StepOutcome::Failed(NodeError::new(
                        NodeErrorKind::Backend,
                        e.to_string(),
                    )),
                }
            }
            other => other,
        };

        let mut dag = run.dag.lock().await;
        let id = dag.node(index).spec.id.clone();
        match outcome {
            StepOutcome::Success(_) => {
                dag.mark(index, NodeState::Completed);
                run.emit_state(&id, NodeState::Completed);
            }
            StepOutcome::Failed(error) => {
                tracing::warn!(node = %id, kind = ?error.kind, "node failed: {}", error.message);
                dag.mark_error(index, NodeState::Failed, error);
                run.emit_state(&id, NodeState::Failed);
                self.handle_failure(run, &mut dag, index);
            }
            StepOutcome::Timeout => {
                let error = NodeError::new(NodeErrorKind::Timeout, "node exceeded its deadline");
                tracing::warn!(node = %id, "node timed out");
                dag.mark_error(index, NodeState::Failed, error);
                run.emit_state(&id, NodeState::Failed);
                self.handle_failure(run, &mut dag, index);
            }
            StepOutcome::Cancelled => {
                dag.mark_error(
                    index,
                    NodeState::Cancelled,
                    NodeError::new(NodeErrorKind::Cancelled, "stack cancelled"),
                );
                run.emit_state(&id, NodeState::Cancelled);
            }
        }
    }

    /// Default policy: skip every transitive successor and let unrelated
    /// branches finish. Fail-fast instead cancels the whole run.
    fn handle_failure(&self, run: &Arc<StackRun>, dag: &mut Dag, index: usize) {
        if run.options.fail_fast {
            run.cancel.cancel();
            return;
        }
        for descendant in dag.descendants(index) {
            if dag.node(descendant).state.is_terminal() {
                continue;
            }
            let id = dag.node(descendant).spec.id.clone();
            dag.mark(descendant, NodeState::Skipped);
            run.emit_state(&id, NodeState::Skipped);
        }
    }

    fn spawn_node(
        &self,
        run: Arc<StackRun>,
        launch: NodeLaunch,
        permit: tokio::sync::OwnedSemaphorePermit,
        done_tx: mpsc::Sender<(usize, StepOutcome)>,
    ) {
        let NodeLaunch {
            index,
            id,
            session_id,
            definition,
            params,
        } = launch;
        // An agent whose params name a command runs out of process.
        let runtime = if params.contains_key("command") {
            self.process_runtime.clone()
        } else {
            self.model_runtime.clone()
        };
        let deadline = params
            .get("timeout")
            .and_then(|v| v.as_f64())
            .map(Duration::from_secs_f64)
            .unwrap_or(run.options.node_timeout);

        tokio::spawn(async move {
            let outcome = async {
                if run.cancel.is_cancelled() {
                    return StepOutcome::Cancelled;
                }

                {
                    let mut dag = run.dag.lock().await;
                    dag.mark(index, NodeState::Running);
                }
                run.emit_state(&id, NodeState::Running);

                let input = match assemble_input(&run, index).await {
                    Ok(input) => input,
                    Err(e) => {
                        return StepOutcome::Failed(NodeError::new(
                            NodeErrorKind::Backend,
                            e.to_string(),
                        ));
                    }
                };

                let node_cancel = run.cancel.child_token();
                let request = InvokeRequest {
                    agent_id: id.clone(),
                    session_id,
                    definition,
                    input,
                    params,
                    deadline,
                    cancel: node_cancel.clone(),
                };

                match tokio::time::timeout(deadline, runtime.invoke(request)).await {
                    Ok(Ok(output)) => StepOutcome::Success(output),
                    Ok(Err(RuntimeError::Cancelled)) => StepOutcome::Cancelled,
                    Ok(Err(e)) => {
                        let kind = match &e {
                            RuntimeError::Shim(_) => NodeErrorKind::Shim,
                            RuntimeError::State(_) => NodeErrorKind::Backend,
                            _ => NodeErrorKind::AgentFailure,
                        };
                        StepOutcome::Failed(NodeError::new(kind, e.to_string()))
                    }
                    Err(_) => {
                        // Deadline exceeded: cancel just this node's work.
                        node_cancel.cancel();
                        StepOutcome::Timeout
                    }
                }
            }
            .await;

            // The permit must drop before the outcome is visible, so the
            // scheduler never observes a drained channel while the worker
            // slot still looks occupied.
            drop(permit);
            let _ = done_tx.send((index, outcome)).await;
        });
    }

    async fn aggregate(&self, run: &Arc<StackRun>, cancelled: bool) -> StackResult {
        let nodes = {
            let dag = run.dag.lock().await;
            dag.reports()
        };
        let mut outputs = run.context.snapshot().await;
        outputs.remove(INPUT_KEY);

        let status = if cancelled {
            StackStatus::AllCancelled
        } else if nodes.iter().all(|n| n.state == NodeState::Completed) {
            StackStatus::AllCompleted
        } else {
            StackStatus::PartialFailure
        };

        StackResult {
            stack_id: run.id.clone(),
            status,
            nodes,
            outputs,
        }
    }
}

/// Gather the node's input from its data-flow predecessors. Nodes with no
/// data edges read the caller's initial input instead.
async fn assemble_input(run: &Arc<StackRun>, index: usize) -> anyhow::Result<Value> {
    let (predecessors, input_key) = {
        let dag = run.dag.lock().await;
        let ids: Vec<String> = dag
            .data_predecessors(index)
            .into_iter()
            .map(|p| dag.node(p).spec.id.clone())
            .collect();
        (ids, dag.node(index).spec.input_key.clone())
    };

    let mut assembled = serde_json::Map::new();
    if predecessors.is_empty() {
        if let Some(initial) = run.context.get(INPUT_KEY).await {
            assembled.insert(INPUT_KEY.to_string(), initial.resolved());
        }
        return Ok(Value::Object(assembled));
    }

    for id in predecessors {
        let output = run
            .context
            .get(&id)
            .await
            .ok_or_else(|| anyhow::anyhow!("upstream output for {:?} is missing", id))?;
        let value = match &input_key {
            Some(key) => output.select(key).unwrap_or(Value::Null),
            None => output.resolved(),
        };
        assembled.insert(id, value);
    }
    Ok(Value::Object(assembled))
}

/// Transition every non-terminal node to Cancelled. Running nodes that
/// ignored the grace period are additionally recorded as unresponsive.
fn cancel_remaining(run: &Arc<StackRun>, dag: &mut Dag, after_grace: bool) {
    for index in 0..dag.len() {
        let state = dag.node(index).state;
        if state.is_terminal() {
            continue;
        }
        let id = dag.node(index).spec.id.clone();
        let error = if after_grace && state == NodeState::Running {
            tracing::warn!(node = %id, "node did not honor cancellation within the grace period");
            NodeError::new(
                NodeErrorKind::UnresponsiveCancel,
                "node did not stop within the cancellation grace period",
            )
        } else {
            NodeError::new(NodeErrorKind::Cancelled, "stack cancelled")
        };
        dag.mark_error(index, NodeState::Cancelled, error);
        run.emit_state(&id, NodeState::Cancelled);
    }
}
