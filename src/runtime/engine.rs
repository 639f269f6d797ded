//! Data-flow execution engine
//!
//! Converts a workflow into its petgraph view and runs it as a data-flow
//! network: a node becomes ready once every incoming connection has either
//! delivered items or gone dead, and ready nodes run concurrently on a
//! `JoinSet`. If/Switch only feed their selected ports, so branches that
//! receive nothing are recorded as skipped and their dead edges propagate
//! downstream. Merge nodes wait for every input, or for `waitTimeoutMs` after
//! the first delivery.
//!
//! Each execution runs on its own task inside an `execution` span. The engine
//! keeps the registry of active executions plus a bounded set of finished
//! records used by status queries and retries.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::runtime::context::{ContextView, ExecutionContext, ExecutionContextStore, ExecutionMode};
use crate::runtime::events::{EventBus, ExecutionEvent};
use crate::runtime::executor::NodeExecutor;
use crate::runtime::graph::ExecutionGraph;
use crate::runtime::nodes::{self, merge, NodeOutput};
use crate::runtime::policy::{ErrorPolicy, ErrorPolicyEngine};
use crate::runtime::record::{ExecutionRecord, ExecutionStatus, ExecutionStep, StepStatus};
use crate::services::{ExecutionHistory, VariableResolver, VariableScope, WorkflowRepository};
use crate::workflow::{validate, Item, NodeType, PortItems, Workflow, MAX_NODE_PORTS};

/// Options controlling what part of the workflow runs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOptions {
    /// Start from the workflow's stored static data and save changes back on success
    #[serde(default)]
    pub load_static_data: bool,
    /// Nodes receiving the input; defaults to every trigger-capable node
    #[serde(default)]
    pub start_nodes: Vec<String>,
    /// Only run ancestors of these nodes
    #[serde(default)]
    pub destination_nodes: Vec<String>,
    /// Precomputed node outputs; these nodes are not re-run
    #[serde(default)]
    pub run_data: HashMap<String, PortItems>,
    /// Execution-level variables, overriding workflow and global ones
    #[serde(default)]
    pub variables: Map<String, Value>,
}

/// Request to run a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub workflow_id: String,
    /// Items handed to the start nodes; `[{}]` when absent
    #[serde(default)]
    pub input_data: Option<Vec<Item>>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub mode: Option<ExecutionMode>,
    /// Return as soon as the execution started
    #[serde(default, rename = "async")]
    pub run_async: bool,
    #[serde(default)]
    pub options: ExecutionOptions,
    #[serde(skip)]
    pub retry_of: Option<String>,
}

fn default_source() -> String {
    "api".to_string()
}

impl ExecutionRequest {
    /// Synchronous manual run.
    pub fn manual(workflow_id: impl Into<String>, input_data: Vec<Item>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            input_data: Some(input_data),
            user_id: None,
            source: "manual".to_string(),
            mode: Some(ExecutionMode::Manual),
            run_async: false,
            options: ExecutionOptions::default(),
            retry_of: None,
        }
    }

    /// Asynchronous run started by a trigger node.
    pub fn from_trigger(
        workflow_id: impl Into<String>,
        node_id: impl Into<String>,
        mode: ExecutionMode,
        source: impl Into<String>,
        input_data: Vec<Item>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            input_data: Some(input_data),
            user_id: None,
            source: source.into(),
            mode: Some(mode),
            run_async: true,
            options: ExecutionOptions {
                start_nodes: vec![node_id.into()],
                ..Default::default()
            },
            retry_of: None,
        }
    }

    pub fn with_options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.run_async = true;
        self
    }
}

/// Request to re-run a finished execution
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRequest {
    /// Re-run from this node; defaults to the node that failed
    #[serde(default)]
    pub from_node: Option<String>,
    #[serde(default)]
    pub load_static_data: Option<bool>,
    #[serde(default, rename = "async")]
    pub run_async: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub status: ExecutionStatus,
}

struct ActiveExecution {
    cancel: CancellationToken,
    done: watch::Receiver<Option<ExecutionStatus>>,
    record: Arc<Mutex<ExecutionRecord>>,
    stop_reason: Option<String>,
}

/// Finished records, oldest evicted first
#[derive(Default)]
struct FinishedExecutions {
    order: VecDeque<String>,
    records: HashMap<String, ExecutionRecord>,
}

impl FinishedExecutions {
    fn insert(&mut self, record: ExecutionRecord, retention: usize) {
        self.order.push_back(record.execution_id.clone());
        self.records.insert(record.execution_id.clone(), record);
        while self.order.len() > retention.max(1) {
            if let Some(evicted) = self.order.pop_front() {
                self.records.remove(&evicted);
            }
        }
    }
}

/// Everything a running execution needs, moved onto its task
struct RunPlan {
    execution_id: String,
    workflow: Arc<Workflow>,
    graph: ExecutionGraph,
    start_nodes: Vec<String>,
    destination_nodes: Vec<String>,
    input: Vec<Item>,
    run_data: HashMap<String, PortItems>,
    load_static_data: bool,
    timeout: Option<Duration>,
    cancel: CancellationToken,
    record: Arc<Mutex<ExecutionRecord>>,
    done: watch::Sender<Option<ExecutionStatus>>,
}

enum RunOutcome {
    Completed,
    Stopped,
    TimedOut(Duration),
    Fatal(EngineError),
}

/// Result of one node attempt, produced on a `JoinSet` task
struct AttemptResult {
    node_id: String,
    attempt: u32,
    input: PortItems,
    started_at: DateTime<Utc>,
    result: Result<NodeOutput>,
}

pub struct WorkflowExecutionEngine {
    repository: Arc<dyn WorkflowRepository>,
    executor: Arc<NodeExecutor>,
    variables: Arc<dyn VariableResolver>,
    history: Arc<dyn ExecutionHistory>,
    contexts: ExecutionContextStore,
    policy: ErrorPolicyEngine,
    events: EventBus,
    active: Mutex<HashMap<String, ActiveExecution>>,
    finished: Mutex<FinishedExecutions>,
    retention: usize,
}

impl WorkflowExecutionEngine {
    pub fn new(
        repository: Arc<dyn WorkflowRepository>,
        executor: Arc<NodeExecutor>,
        variables: Arc<dyn VariableResolver>,
        history: Arc<dyn ExecutionHistory>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            repository,
            executor,
            variables,
            history,
            contexts: ExecutionContextStore::new(),
            policy: ErrorPolicyEngine::new(),
            events: EventBus::new(config.event_capacity),
            active: Mutex::new(HashMap::new()),
            finished: Mutex::new(FinishedExecutions::default()),
            retention: config.execution_retention,
        }
    }

    /// Starts an execution.
    ///
    /// Fails up front when the workflow is missing or invalid. Otherwise the run
    /// happens on its own task; synchronous requests wait for it to finish.
    pub async fn execute(self: &Arc<Self>, request: ExecutionRequest) -> Result<ExecutionSummary> {
        // STEP 1: Load and check the workflow
        let workflow = self
            .repository
            .find_by_id(&request.workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(request.workflow_id.clone()))?;
        let report = validate(&workflow);
        if !report.is_valid {
            return Err(EngineError::Validation(report.errors));
        }
        let graph = ExecutionGraph::from_workflow(&workflow)?;

        // STEP 2: Resolve start and destination nodes
        let start_nodes: Vec<String> = if request.options.start_nodes.is_empty() {
            workflow.trigger_nodes().map(|node| node.id.clone()).collect()
        } else {
            request.options.start_nodes.clone()
        };
        for node_id in start_nodes.iter().chain(&request.options.destination_nodes) {
            if !graph.contains(node_id) {
                return Err(EngineError::InvalidRequest(format!("Unknown node '{node_id}'")));
            }
        }
        if start_nodes.is_empty() {
            return Err(EngineError::Validation(vec!["Workflow has no trigger or start node".to_string()]));
        }

        let execution_id = Uuid::new_v4().to_string();
        let mode = request.mode.unwrap_or(ExecutionMode::Manual);
        let input = request.input_data.unwrap_or_else(|| vec![json!({})]);

        // STEP 3: Create the execution context
        let variables = self
            .variables
            .resolve(VariableScope {
                workflow_id: &workflow.id,
                user_id: request.user_id.as_deref(),
                execution: &request.options.variables,
            })
            .await?;
        let static_data = if request.options.load_static_data {
            workflow.static_data.clone()
        } else {
            Map::new()
        };
        self.contexts.create(ExecutionContext {
            execution_id: execution_id.clone(),
            workflow_id: workflow.id.clone(),
            workflow_name: workflow.name.clone(),
            user_id: request.user_id.clone(),
            mode,
            source: request.source.clone(),
            input_data: input.clone(),
            variables,
            static_data,
            settings: workflow.settings.clone(),
            started_at: Utc::now(),
        })?;

        // STEP 4: Register as active
        let mut record = ExecutionRecord::new(
            execution_id.clone(),
            workflow.id.clone(),
            mode,
            request.source.clone(),
            request.user_id.clone(),
            input.clone(),
            start_nodes.clone(),
        );
        record.retry_of = request.retry_of.clone();
        let record = Arc::new(Mutex::new(record));
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);
        self.active.lock().insert(
            execution_id.clone(),
            ActiveExecution {
                cancel: cancel.clone(),
                done: done_rx.clone(),
                record: Arc::clone(&record),
                stop_reason: None,
            },
        );

        self.events.emit(ExecutionEvent::Started {
            execution_id: execution_id.clone(),
            workflow_id: workflow.id.clone(),
            mode,
        });
        tracing::info!(
            "🚀 Starting execution {} of workflow '{}' from {:?} ({})",
            execution_id,
            workflow.id,
            start_nodes,
            mode.as_str()
        );

        // STEP 5: Run on its own task
        let span = tracing::info_span!("execution", execution_id = %execution_id, workflow_id = %workflow.id);
        let plan = RunPlan {
            execution_id: execution_id.clone(),
            timeout: workflow.settings.execution_timeout_secs.map(Duration::from_secs),
            workflow,
            graph,
            start_nodes,
            destination_nodes: request.options.destination_nodes,
            input,
            run_data: request.options.run_data,
            load_static_data: request.options.load_static_data,
            cancel,
            record,
            done: done_tx,
        };
        let engine = Arc::clone(self);
        let run = tokio::spawn(Arc::clone(&engine).run_execution(plan).instrument(span));
        let watched_id = execution_id.clone();
        tokio::spawn(async move {
            if let Err(join_err) = run.await {
                engine.abandon(&watched_id, join_err.to_string());
            }
        });

        if request.run_async {
            return Ok(ExecutionSummary {
                execution_id,
                status: ExecutionStatus::Running,
            });
        }
        let status = wait_done(done_rx).await;
        Ok(ExecutionSummary { execution_id, status })
    }

    /// Requests cancellation. Returns false when the execution already finished.
    pub fn stop(&self, execution_id: &str, reason: impl Into<String>) -> Result<bool> {
        {
            let mut active = self.active.lock();
            if let Some(execution) = active.get_mut(execution_id) {
                if execution.stop_reason.is_none() {
                    execution.stop_reason = Some(reason.into());
                    execution.cancel.cancel();
                    tracing::info!("🛑 Stopping execution {}", execution_id);
                }
            } else if self.finished.lock().records.contains_key(execution_id) {
                return Ok(false);
            } else {
                return Err(EngineError::ExecutionNotFound(execution_id.to_string()));
            }
        }
        self.executor.cancel_execution(execution_id);
        Ok(true)
    }

    /// Re-runs a finished execution, reusing the outputs of every node that is
    /// not downstream of `from_node` (or of the failed node).
    pub async fn retry(self: &Arc<Self>, execution_id: &str, request: RetryRequest) -> Result<ExecutionSummary> {
        let original = match self.get_execution(execution_id) {
            Some(record) => record,
            None => self
                .history
                .find(execution_id)
                .await?
                .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))?,
        };
        if !original.status.is_finished() {
            return Err(EngineError::InvalidRequest(format!(
                "Execution {execution_id} is still running"
            )));
        }

        let workflow = self
            .repository
            .find_by_id(&original.workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(original.workflow_id.clone()))?;
        let graph = ExecutionGraph::from_workflow(&workflow)?;

        let from_node = request
            .from_node
            .clone()
            .or_else(|| original.failed_node().map(str::to_string));
        let run_data = match &from_node {
            Some(from) => {
                if !graph.contains(from) {
                    return Err(EngineError::InvalidRequest(format!("Unknown node '{from}'")));
                }
                let rerun = graph.reachable_from([from.as_str()]);
                original
                    .run_data
                    .into_iter()
                    .filter(|(node_id, _)| !rerun.contains(node_id))
                    .collect()
            }
            None => HashMap::new(),
        };

        tracing::info!("🔁 Retrying execution {} from {:?}", execution_id, from_node);
        self.execute(ExecutionRequest {
            workflow_id: original.workflow_id,
            input_data: Some(original.input_data),
            user_id: original.user_id,
            source: "retry".to_string(),
            mode: Some(ExecutionMode::Retry),
            run_async: request.run_async,
            options: ExecutionOptions {
                load_static_data: request.load_static_data.unwrap_or(false),
                start_nodes: original.start_nodes,
                run_data,
                ..Default::default()
            },
            retry_of: Some(execution_id.to_string()),
        })
        .await
    }

    pub fn get_status(&self, execution_id: &str) -> Option<ExecutionStatus> {
        self.get_execution(execution_id).map(|record| record.status)
    }

    /// Live or retained record of an execution.
    pub fn get_execution(&self, execution_id: &str) -> Option<ExecutionRecord> {
        if let Some(execution) = self.active.lock().get(execution_id) {
            return Some(execution.record.lock().clone());
        }
        self.finished.lock().records.get(execution_id).cloned()
    }

    /// Context of a running execution. Contexts are gone once it finished.
    pub fn get_context(&self, execution_id: &str) -> Option<ContextView> {
        self.contexts.view(execution_id)
    }

    pub fn active_executions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Waits until the execution finished, or `timeout` elapsed, and returns its record.
    pub async fn wait_for_completion(&self, execution_id: &str, timeout: Option<Duration>) -> Result<ExecutionRecord> {
        let done = self
            .active
            .lock()
            .get(execution_id)
            .map(|execution| execution.done.clone());
        if let Some(done) = done {
            match timeout {
                Some(limit) => {
                    let _ = tokio::time::timeout(limit, wait_done(done)).await;
                }
                None => {
                    wait_done(done).await;
                }
            }
        }
        self.get_execution(execution_id)
            .ok_or_else(|| EngineError::ExecutionNotFound(execution_id.to_string()))
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    /// Stops every active execution and waits up to `grace` for each to settle.
    pub async fn shutdown(&self, grace: Duration) {
        let ids = self.active_executions();
        tracing::info!("🛑 Stopping {} active executions", ids.len());
        for id in &ids {
            let _ = self.stop(id, "Engine shutting down");
        }
        for id in &ids {
            let _ = self.wait_for_completion(id, Some(grace)).await;
        }
    }

    async fn run_execution(self: Arc<Self>, plan: RunPlan) {
        let far_future = Instant::now() + Duration::from_secs(86_400 * 365);
        let execution_deadline = plan.timeout.map(|limit| Instant::now() + limit);
        let mut traversal = Traversal::new(&plan);
        let mut tasks: JoinSet<AttemptResult> = JoinSet::new();

        let outcome = loop {
            // STEP 1: Start everything that is ready
            let mut fatal = None;
            while let Some(node_id) = traversal.ready.pop_front() {
                if plan.cancel.is_cancelled() {
                    break;
                }
                if let Err(err) = self.start_node(&plan, &mut traversal, &mut tasks, &node_id, 1, Duration::ZERO) {
                    fatal = Some(err);
                    break;
                }
            }
            if let Some(err) = fatal {
                break RunOutcome::Fatal(err);
            }
            if tasks.is_empty() && traversal.ready.is_empty() {
                break RunOutcome::Completed;
            }

            // STEP 2: Wait for the next attempt, deadline or stop request
            let merge_deadline = traversal.next_deadline();
            tokio::select! {
                biased;
                _ = plan.cancel.cancelled() => break RunOutcome::Stopped,
                _ = tokio::time::sleep_until(execution_deadline.unwrap_or(far_future)), if execution_deadline.is_some() => {
                    break RunOutcome::TimedOut(plan.timeout.unwrap_or_default());
                }
                _ = tokio::time::sleep_until(merge_deadline.unwrap_or(far_future)), if merge_deadline.is_some() => {
                    traversal.expire_merges(Instant::now());
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok(attempt)) => {
                        if let Some(err) = self.finish_attempt(&plan, &mut traversal, &mut tasks, attempt) {
                            break RunOutcome::Fatal(err);
                        }
                    }
                    Some(Err(join_err)) => {
                        break RunOutcome::Fatal(EngineError::Fatal {
                            execution_id: plan.execution_id.clone(),
                            message: format!("Node task failed: {join_err}"),
                        });
                    }
                    None => {}
                },
            }
        };

        if !matches!(outcome, RunOutcome::Completed) {
            plan.cancel.cancel();
            self.executor.cancel_execution(&plan.execution_id);
            tasks.shutdown().await;
        }
        drop(traversal);
        self.finalize(plan, outcome).await;
    }

    /// Runs a ready node: reuses run data, passes disabled nodes through, or
    /// spawns an attempt.
    fn start_node(
        &self,
        plan: &RunPlan,
        traversal: &mut Traversal<'_>,
        tasks: &mut JoinSet<AttemptResult>,
        node_id: &str,
        attempt: u32,
        delay: Duration,
    ) -> Result<()> {
        let node = plan.workflow.node(node_id).ok_or_else(|| EngineError::Fatal {
            execution_id: plan.execution_id.clone(),
            message: format!("Node '{node_id}' disappeared from the workflow"),
        })?;
        let input = traversal.inputs(node_id);

        if let Some(ports) = plan.run_data.get(node_id) {
            tracing::debug!("♻️ Reusing stored output of node {}", node_id);
            self.store_output(plan, node_id, ports);
            traversal.complete(node_id, ports, None);
            return Ok(());
        }

        if node.disabled {
            let ports = vec![nodes::flatten_inputs(input.clone())];
            let now = Utc::now();
            plan.record.lock().steps.push(ExecutionStep {
                node_id: node_id.to_string(),
                status: StepStatus::Skipped,
                attempt,
                input,
                output: Some(ports.clone()),
                error: None,
                started_at: now,
                finished_at: now,
            });
            self.store_output(plan, node_id, &ports);
            traversal.complete(node_id, &ports, None);
            return Ok(());
        }

        let context = self.contexts.snapshot(&plan.execution_id).ok_or_else(|| EngineError::Fatal {
            execution_id: plan.execution_id.clone(),
            message: "Execution context is gone".to_string(),
        })?;
        traversal.mark_running(node_id);

        let executor = Arc::clone(&self.executor);
        let events = self.events.clone();
        let cancel = plan.cancel.clone();
        let node = node.clone();
        tasks.spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return AttemptResult {
                            node_id: node.id.clone(),
                            attempt,
                            input,
                            started_at: Utc::now(),
                            result: Err(EngineError::NodeCanceled(node.id.clone())),
                        };
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            events.emit(ExecutionEvent::NodeStarted {
                execution_id: context.execution_id.clone(),
                node_id: node.id.clone(),
                attempt,
            });
            let started_at = Utc::now();
            let result = executor.execute_node(&node, input.clone(), &context, &cancel).await;
            AttemptResult {
                node_id: node.id.clone(),
                attempt,
                input,
                started_at,
                result,
            }
        });
        Ok(())
    }

    /// Applies an attempt's result. Returns the error when it is fatal.
    fn finish_attempt(
        &self,
        plan: &RunPlan,
        traversal: &mut Traversal<'_>,
        tasks: &mut JoinSet<AttemptResult>,
        attempt: AttemptResult,
    ) -> Option<EngineError> {
        let AttemptResult {
            node_id,
            attempt,
            input,
            started_at,
            result,
        } = attempt;

        let err = match result {
            Ok(output) => {
                if let Some(patch) = output.static_data {
                    self.contexts.apply_static_data(&plan.execution_id, patch);
                }
                let items = output.ports.iter().map(Vec::len).sum();
                plan.record.lock().steps.push(ExecutionStep {
                    node_id: node_id.clone(),
                    status: StepStatus::Completed,
                    attempt,
                    input,
                    output: Some(output.ports.clone()),
                    error: None,
                    started_at,
                    finished_at: Utc::now(),
                });
                self.store_output(plan, &node_id, &output.ports);
                self.events.emit(ExecutionEvent::NodeCompleted {
                    execution_id: plan.execution_id.clone(),
                    node_id: node_id.clone(),
                    items,
                });
                tracing::debug!("✅ Node {} completed with {} items", node_id, items);
                traversal.complete(&node_id, &output.ports, None);
                return None;
            }
            // The stop branch of the run loop takes it from here
            Err(EngineError::NodeCanceled(_)) if plan.cancel.is_cancelled() => return None,
            Err(err) => err,
        };

        let Some(node) = plan.workflow.node(&node_id) else {
            return Some(err);
        };
        let message = err.to_string();
        let decision = self
            .policy
            .decide(&plan.execution_id, &node_id, &ErrorPolicy::from(&node.retry));

        plan.record.lock().steps.push(ExecutionStep {
            node_id: node_id.clone(),
            status: StepStatus::Failed,
            attempt,
            input: input.clone(),
            output: None,
            error: Some(message.clone()),
            started_at,
            finished_at: Utc::now(),
        });
        self.events.emit(ExecutionEvent::NodeFailed {
            execution_id: plan.execution_id.clone(),
            node_id: node_id.clone(),
            error: message.clone(),
            will_retry: decision.should_retry,
        });

        if decision.should_retry {
            tracing::warn!(
                "🔁 Node {} failed (attempt {}), retrying in {:?}: {}",
                node_id,
                attempt,
                decision.retry_delay,
                message
            );
            if let Err(err) = self.start_node(plan, traversal, tasks, &node_id, attempt + 1, decision.retry_delay) {
                return Some(err);
            }
            return None;
        }

        if decision.should_continue {
            tracing::warn!("⚠️ Node {} failed, continuing with error item: {}", node_id, message);
            let ports = vec![vec![nodes::error_item(&node_id, &message)]];
            self.store_output(plan, &node_id, &ports);
            traversal.complete(&node_id, &ports, None);
            return None;
        }

        if let Some(fallback) = decision.fallback_node {
            tracing::warn!("↪️ Node {} failed, routing error to fallback {}: {}", node_id, fallback, message);
            traversal.complete(&node_id, &Vec::new(), Some(nodes::error_item(&node_id, &message)));
            return None;
        }

        tracing::error!("❌ Node {} failed: {}", node_id, message);
        Some(err)
    }

    fn store_output(&self, plan: &RunPlan, node_id: &str, ports: &PortItems) {
        let mut record = plan.record.lock();
        record.run_data.insert(node_id.to_string(), ports.clone());
        record.last_node_output = ports.iter().flatten().cloned().collect();
    }

    async fn finalize(&self, plan: RunPlan, outcome: RunOutcome) {
        let execution_id = plan.execution_id.clone();
        let context = self.contexts.destroy(&execution_id);
        self.policy.reset_execution(&execution_id);

        let stop_reason = self
            .active
            .lock()
            .get(&execution_id)
            .and_then(|execution| execution.stop_reason.clone());
        let (status, error) = match outcome {
            RunOutcome::Completed => (ExecutionStatus::Success, None),
            RunOutcome::Stopped => (ExecutionStatus::Canceled, None),
            RunOutcome::TimedOut(limit) => (
                ExecutionStatus::Error,
                Some(EngineError::Fatal {
                    execution_id: execution_id.clone(),
                    message: format!("Execution exceeded its timeout of {}s", limit.as_secs()),
                }),
            ),
            RunOutcome::Fatal(err) => (ExecutionStatus::Error, Some(err)),
        };

        // STEP 1: Persist changed static data
        if status == ExecutionStatus::Success && plan.load_static_data {
            if let Some(context) = &context {
                if context.static_data != plan.workflow.static_data {
                    let mut workflow = (*plan.workflow).clone();
                    workflow.static_data = context.static_data.clone();
                    match self.repository.save(workflow).await {
                        Ok(()) => tracing::debug!("💾 Saved static data of workflow {}", plan.workflow.id),
                        Err(e) => tracing::warn!("⚠️ Failed to save static data of {}: {}", plan.workflow.id, e),
                    }
                }
            }
        }

        self.seal(&execution_id, &plan.record, status, error, stop_reason);
        let _ = plan.done.send(Some(status));
    }

    /// Cleans up after an execution task that died without finalizing, so the
    /// run leaves the active registry and waiters see an error.
    fn abandon(&self, execution_id: &str, cause: String) {
        let Some(record) = self
            .active
            .lock()
            .get(execution_id)
            .map(|execution| Arc::clone(&execution.record))
        else {
            return;
        };
        self.contexts.destroy(execution_id);
        self.policy.reset_execution(execution_id);
        let error = EngineError::Fatal {
            execution_id: execution_id.to_string(),
            message: format!("Execution task aborted: {cause}"),
        };
        self.seal(execution_id, &record, ExecutionStatus::Error, Some(error), None);
    }

    /// Writes the final status, moves the record to the finished set, emits
    /// the terminal event and hands the record to the history writer.
    fn seal(
        &self,
        execution_id: &str,
        record: &Mutex<ExecutionRecord>,
        status: ExecutionStatus,
        error: Option<EngineError>,
        stop_reason: Option<String>,
    ) {
        // STEP 2: Seal the record and move it to the finished set
        let record = {
            let mut active = self.active.lock();
            // Already sealed
            if active.remove(execution_id).is_none() {
                return;
            }
            let mut record = record.lock();
            record.status = status;
            record.finished_at = Some(Utc::now());
            if let Some(err) = &error {
                record.error = Some(err.to_string());
                record.error_chain = err.chain();
            }
            let record = record.clone();
            self.finished.lock().insert(record.clone(), self.retention);
            record
        };

        // STEP 3: Terminal event
        match status {
            ExecutionStatus::Success => {
                tracing::info!("🎉 Execution {} completed", execution_id);
                self.events.emit(ExecutionEvent::Completed {
                    execution_id: execution_id.to_string(),
                    duration_ms: record.duration_ms().unwrap_or_default(),
                });
            }
            ExecutionStatus::Canceled => {
                let reason = stop_reason.unwrap_or_else(|| "Stopped".to_string());
                tracing::info!("🛑 Execution {} canceled: {}", execution_id, reason);
                self.events.emit(ExecutionEvent::Stopped {
                    execution_id: execution_id.to_string(),
                    reason,
                });
            }
            _ => {
                let message = record.error.clone().unwrap_or_default();
                tracing::error!("💥 Execution {} failed: {}", execution_id, message);
                self.events.emit(ExecutionEvent::Failed {
                    execution_id: execution_id.to_string(),
                    message,
                    chain: record.error_chain.clone(),
                });
            }
        }

        // STEP 4: History is fire-and-forget
        let history = Arc::clone(&self.history);
        tokio::spawn(async move {
            if let Err(e) = history.record(&record).await {
                tracing::warn!("⚠️ Failed to write execution history for {}: {}", record.execution_id, e);
            }
        });
    }
}

async fn wait_done(mut done: watch::Receiver<Option<ExecutionStatus>>) -> ExecutionStatus {
    loop {
        let current = *done.borrow();
        if let Some(status) = current {
            return status;
        }
        if done.changed().await.is_err() {
            let last = *done.borrow();
            return last.unwrap_or(ExecutionStatus::Error);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Waiting,
    Queued,
    Running,
    Done,
    Skipped,
}

/// Per-node traversal bookkeeping
#[derive(Debug)]
struct Slot {
    state: SlotState,
    /// Incoming edges (fallback references included) not resolved yet
    pending: usize,
    inputs: PortItems,
    received: bool,
    deadline: Option<Instant>,
    wait_timeout: Option<Duration>,
}

/// Readiness tracking for one execution
struct Traversal<'a> {
    plan: &'a RunPlan,
    slots: HashMap<String, Slot>,
    ready: VecDeque<String>,
}

impl<'a> Traversal<'a> {
    fn new(plan: &'a RunPlan) -> Self {
        let active = active_nodes(plan);
        let mut slots = HashMap::new();

        for node in plan.workflow.nodes.iter().filter(|n| active.contains(&n.id)) {
            let incoming: Vec<_> = plan
                .graph
                .incoming(&node.id)
                .into_iter()
                .filter(|edge| active.contains(&edge.source))
                .collect();
            let fallback_refs = plan
                .workflow
                .nodes
                .iter()
                .filter(|other| active.contains(&other.id))
                .filter(|other| other.retry.fallback_node.as_deref() == Some(node.id.as_str()))
                .count();

            let mut width = incoming
                .iter()
                .map(|edge| edge.link.input.saturating_add(1))
                .max()
                .unwrap_or(1)
                .min(MAX_NODE_PORTS);
            let mut wait_timeout = None;
            if node.node_type == NodeType::Merge {
                width = width.max(merge::input_count(node));
                wait_timeout = merge::wait_timeout_ms(node).map(Duration::from_millis);
            }

            slots.insert(
                node.id.clone(),
                Slot {
                    state: SlotState::Waiting,
                    pending: incoming.len() + fallback_refs,
                    inputs: vec![Vec::new(); width],
                    received: false,
                    deadline: None,
                    wait_timeout,
                },
            );
        }

        let mut ready = VecDeque::new();
        for start in &plan.start_nodes {
            if let Some(slot) = slots.get_mut(start) {
                if slot.state != SlotState::Waiting {
                    continue;
                }
                slot.pending = 0;
                slot.inputs[0] = plan.input.clone();
                slot.received = true;
                slot.state = SlotState::Queued;
                ready.push_back(start.clone());
            }
        }

        Self { plan, slots, ready }
    }

    fn inputs(&self, node_id: &str) -> PortItems {
        self.slots
            .get(node_id)
            .map(|slot| slot.inputs.clone())
            .unwrap_or_default()
    }

    fn mark_running(&mut self, node_id: &str) {
        if let Some(slot) = self.slots.get_mut(node_id) {
            slot.state = SlotState::Running;
        }
    }

    /// Marks a node done and feeds its ports downstream. `fallback_item` goes
    /// to the node's fallback target; otherwise that reference resolves empty.
    fn complete(&mut self, node_id: &str, ports: &PortItems, fallback_item: Option<Item>) {
        if let Some(slot) = self.slots.get_mut(node_id) {
            slot.state = SlotState::Done;
        }
        for edge in self.plan.graph.outgoing(node_id) {
            let items = ports.get(edge.link.output).cloned().unwrap_or_default();
            self.deliver(&edge.target, edge.link.input, items);
        }
        if let Some(target) = self.fallback_of(node_id) {
            self.deliver(&target, 0, fallback_item.into_iter().collect());
        }
    }

    fn fallback_of(&self, node_id: &str) -> Option<String> {
        self.plan
            .workflow
            .node(node_id)
            .and_then(|node| node.retry.fallback_node.clone())
            .filter(|target| self.slots.contains_key(target))
    }

    fn deliver(&mut self, target: &str, input: usize, items: Vec<Item>) {
        let Some(slot) = self.slots.get_mut(target) else {
            return;
        };
        // Late deliveries (e.g. after a merge timed out) are dropped
        if slot.state != SlotState::Waiting {
            return;
        }
        slot.pending = slot.pending.saturating_sub(1);
        if !items.is_empty() {
            let Some(port) = slot.inputs.get_mut(input) else {
                tracing::warn!("⚠️ Dropping {} items sent to missing input {} of {}", items.len(), input, target);
                self.settle(target);
                return;
            };
            port.extend(items);
            slot.received = true;
            if slot.deadline.is_none() {
                slot.deadline = slot.wait_timeout.map(|limit| Instant::now() + limit);
            }
        }
        self.settle(target);
    }

    /// Queues nodes whose inputs are resolved; skips the ones that got nothing
    /// and propagates their dead edges.
    fn settle(&mut self, node_id: &str) {
        let mut work = vec![node_id.to_string()];
        while let Some(id) = work.pop() {
            let Some(slot) = self.slots.get_mut(&id) else {
                continue;
            };
            if slot.state != SlotState::Waiting || slot.pending > 0 {
                continue;
            }
            if slot.received {
                slot.state = SlotState::Queued;
                self.ready.push_back(id);
                continue;
            }

            slot.state = SlotState::Skipped;
            let now = Utc::now();
            self.plan.record.lock().steps.push(ExecutionStep {
                node_id: id.clone(),
                status: StepStatus::Skipped,
                attempt: 0,
                input: Vec::new(),
                output: None,
                error: None,
                started_at: now,
                finished_at: now,
            });
            tracing::debug!("⏭️ Skipping node {} (no input reached it)", id);

            let mut targets: Vec<String> = self
                .plan
                .graph
                .outgoing(&id)
                .into_iter()
                .map(|edge| edge.target)
                .collect();
            targets.extend(self.fallback_of(&id));
            for target in targets {
                if let Some(next) = self.slots.get_mut(&target) {
                    if next.state == SlotState::Waiting {
                        next.pending = next.pending.saturating_sub(1);
                        work.push(target);
                    }
                }
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.slots
            .values()
            .filter(|slot| slot.state == SlotState::Waiting)
            .filter_map(|slot| slot.deadline)
            .min()
    }

    /// Queues merges whose wait timeout elapsed with partial input.
    fn expire_merges(&mut self, now: Instant) {
        let mut expired: Vec<&String> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.state == SlotState::Waiting && slot.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| id)
            .collect();
        expired.sort();
        let expired: Vec<String> = expired.into_iter().cloned().collect();
        for id in expired {
            if let Some(slot) = self.slots.get_mut(&id) {
                tracing::debug!("⏰ Merge {} timed out waiting for {} inputs", id, slot.pending);
                slot.state = SlotState::Queued;
                self.ready.push_back(id);
            }
        }
    }
}

/// Nodes taking part in a run: reachable from the start nodes (following
/// fallback references too), limited to ancestors of the destinations.
fn active_nodes(plan: &RunPlan) -> HashSet<String> {
    let mut roots: Vec<String> = plan.start_nodes.clone();
    let mut active = plan.graph.reachable_from(roots.iter().map(String::as_str));
    loop {
        let extra: Vec<String> = plan
            .workflow
            .nodes
            .iter()
            .filter(|node| active.contains(&node.id))
            .filter_map(|node| node.retry.fallback_node.clone())
            .filter(|target| !active.contains(target) && plan.graph.contains(target))
            .collect();
        if extra.is_empty() {
            break;
        }
        roots.extend(extra);
        active = plan.graph.reachable_from(roots.iter().map(String::as_str));
    }

    if !plan.destination_nodes.is_empty() {
        let needed = plan
            .graph
            .ancestors_of(plan.destination_nodes.iter().map(String::as_str));
        active.retain(|node_id| needed.contains(node_id));
    }
    active
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::runtime::sandbox::Sandbox;
    use crate::services::{LayeredVariables, NoopHistory, StaticCredentialVault};
    use crate::workflow::WorkflowRegistry;

    async fn engine_with(workflow: Value) -> (Arc<WorkflowExecutionEngine>, Arc<WorkflowRegistry>) {
        let registry = Arc::new(WorkflowRegistry::in_memory());
        let workflow: Workflow = serde_json::from_value(workflow).unwrap();
        let report = registry.register(workflow).await.unwrap();
        assert!(report.is_valid, "{report:?}");
        (engine_over(&registry), registry)
    }

    fn engine_over(registry: &Arc<WorkflowRegistry>) -> Arc<WorkflowExecutionEngine> {
        let config = Config::default();
        let executor = NodeExecutor::new(
            Sandbox::default(),
            Arc::new(StaticCredentialVault::new()),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        let engine = WorkflowExecutionEngine::new(
            Arc::clone(registry) as Arc<dyn WorkflowRepository>,
            Arc::new(executor),
            Arc::new(LayeredVariables::new()),
            Arc::new(NoopHistory),
            &config.engine,
        );
        Arc::new(engine)
    }

    fn output_of(record: &ExecutionRecord, node_id: &str) -> PortItems {
        record.run_data.get(node_id).cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_if_branch_skips_untaken_side() {
        let (engine, _) = engine_with(json!({
            "id": "wf",
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "check", "type": "if", "parameters": {
                    "conditions": [{"value1": "={{ $json.a }}", "operation": "equal", "value2": "yes"}]
                }},
                {"id": "yes", "type": "set", "parameters": {"values": {"branch": "yes"}}},
                {"id": "no", "type": "set", "parameters": {"values": {"branch": "no"}}}
            ],
            "connections": [
                {"sourceNodeId": "start", "targetNodeId": "check"},
                {"sourceNodeId": "check", "sourceOutput": "true", "targetNodeId": "yes"},
                {"sourceNodeId": "check", "sourceOutput": "false", "targetNodeId": "no"}
            ]
        }))
        .await;

        let summary = engine
            .execute(ExecutionRequest::manual("wf", vec![json!({"a": "yes"}), json!({"a": "yes"})]))
            .await
            .unwrap();
        assert_eq!(summary.status, ExecutionStatus::Success);

        let record = engine.get_execution(&summary.execution_id).unwrap();
        assert_eq!(output_of(&record, "yes")[0].len(), 2);
        let skipped: Vec<_> = record.steps_for("no").collect();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].status, StepStatus::Skipped);
        assert!(engine.active_executions().is_empty());
        assert!(engine.get_context(&summary.execution_id).is_none());
    }

    #[tokio::test]
    async fn test_out_of_range_target_input_rejected_before_run() {
        let registry = Arc::new(WorkflowRegistry::in_memory());
        let workflow: Workflow = serde_json::from_value(json!({
            "id": "wf",
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "set", "type": "set"}
            ],
            "connections": [
                {"sourceNodeId": "start", "targetNodeId": "set", "targetInput": u64::MAX}
            ]
        }))
        .unwrap();
        let report = registry.register(workflow).await.unwrap();
        assert!(!report.is_valid);

        let engine = engine_over(&registry);
        let err = engine.execute(ExecutionRequest::manual("wf", vec![json!({})])).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)), "{err:?}");
        assert!(engine.active_executions().is_empty());
    }

    #[tokio::test]
    async fn test_aborted_task_still_leaves_active_registry() {
        // Accepts connections but never answers, so the run stays in flight
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hang", listener.local_addr().unwrap());
        let (engine, _) = engine_with(json!({
            "id": "wf",
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "call", "type": "httpRequest", "parameters": {"url": url}}
            ],
            "connections": [{"sourceNodeId": "start", "targetNodeId": "call"}]
        }))
        .await;
        let mut events = engine.subscribe();

        let summary = engine
            .execute(ExecutionRequest::manual("wf", vec![json!({})]).asynchronous())
            .await
            .unwrap();
        let id = summary.execution_id;
        assert_eq!(engine.active_executions(), vec![id.clone()]);

        engine.abandon(&id, "task panicked".to_string());
        assert!(engine.active_executions().is_empty());
        assert!(engine.get_context(&id).is_none());
        let record = engine.get_execution(&id).unwrap();
        assert_eq!(record.status, ExecutionStatus::Error);
        assert!(record.error.unwrap().contains("task panicked"));

        // Sealed once, and no longer stoppable
        assert!(!engine.stop(&id, "late").unwrap());
        let mut failed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ExecutionEvent::Failed { .. }) {
                failed += 1;
            }
        }
        assert_eq!(failed, 1);
        drop(listener);
    }

    #[tokio::test]
    async fn test_merge_waits_for_both_branches() {
        let (engine, _) = engine_with(json!({
            "id": "wf",
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "left", "type": "set", "parameters": {"values": {"side": "left"}}},
                {"id": "right", "type": "code", "parameters": {"code": "return { { side = 'right' }, { side = 'right' } }"}},
                {"id": "join", "type": "merge"}
            ],
            "connections": [
                {"sourceNodeId": "start", "targetNodeId": "left"},
                {"sourceNodeId": "start", "targetNodeId": "right"},
                {"sourceNodeId": "left", "targetNodeId": "join"},
                {"sourceNodeId": "right", "targetNodeId": "join", "targetInput": 1}
            ]
        }))
        .await;

        let summary = engine.execute(ExecutionRequest::manual("wf", vec![json!({})])).await.unwrap();
        let record = engine.get_execution(&summary.execution_id).unwrap();
        assert_eq!(output_of(&record, "join")[0].len(), 3);
        assert_eq!(record.steps_for("join").count(), 1);
    }

    #[tokio::test]
    async fn test_continue_on_fail_emits_error_item() {
        let (engine, _) = engine_with(json!({
            "id": "wf",
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "boom", "type": "code", "parameters": {"code": "error('nope')"},
                 "retry": {"continueOnFail": true}},
                {"id": "after", "type": "set", "parameters": {"values": {"seen": true}}}
            ],
            "connections": [
                {"sourceNodeId": "start", "targetNodeId": "boom"},
                {"sourceNodeId": "boom", "targetNodeId": "after"}
            ]
        }))
        .await;

        let summary = engine.execute(ExecutionRequest::manual("wf", vec![json!({})])).await.unwrap();
        assert_eq!(summary.status, ExecutionStatus::Success);
        let record = engine.get_execution(&summary.execution_id).unwrap();
        let after = &output_of(&record, "after")[0][0];
        assert_eq!(after["node"], json!("boom"));
        assert_eq!(after["seen"], json!(true));
        assert!(record.failed_node().is_none());
    }

    #[tokio::test]
    async fn test_fallback_node_receives_error() {
        let (engine, _) = engine_with(json!({
            "id": "wf",
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "boom", "type": "code", "parameters": {"code": "error('nope')"},
                 "retry": {"fallbackNode": "rescue"}},
                {"id": "next", "type": "set", "parameters": {"values": {"ok": true}}},
                {"id": "rescue", "type": "set", "parameters": {"values": {"rescued": true}}}
            ],
            "connections": [
                {"sourceNodeId": "start", "targetNodeId": "boom"},
                {"sourceNodeId": "boom", "targetNodeId": "next"}
            ]
        }))
        .await;

        let summary = engine.execute(ExecutionRequest::manual("wf", vec![json!({})])).await.unwrap();
        assert_eq!(summary.status, ExecutionStatus::Success);
        let record = engine.get_execution(&summary.execution_id).unwrap();
        assert_eq!(output_of(&record, "rescue")[0][0]["rescued"], json!(true));
        assert_eq!(record.steps_for("next").next().unwrap().status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_fatal_failure_and_retry_from_failed_node() {
        let (engine, registry) = engine_with(json!({
            "id": "wf",
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "prep", "type": "set", "parameters": {"values": {"n": 2}}},
                {"id": "calc", "type": "code", "parameters": {"code": "if vars.fixed then return { ok = true } end error('not yet')"}}
            ],
            "connections": [
                {"sourceNodeId": "start", "targetNodeId": "prep"},
                {"sourceNodeId": "prep", "targetNodeId": "calc"}
            ]
        }))
        .await;

        let first = engine.execute(ExecutionRequest::manual("wf", vec![json!({})])).await.unwrap();
        assert_eq!(first.status, ExecutionStatus::Error);
        let failed = engine.get_execution(&first.execution_id).unwrap();
        assert_eq!(failed.failed_node(), Some("calc"));
        assert!(failed.error.as_deref().unwrap_or_default().contains("not yet"));

        // Ship a fixed version of the failing node
        let mut workflow = (*registry.get_workflow("wf").unwrap().workflow).clone();
        workflow.nodes[2].parameters = json!({"code": "return { ok = true, n = json.n }"});
        registry.register(workflow).await.unwrap();

        let retried = engine.retry(&first.execution_id, RetryRequest::default()).await.unwrap();
        assert_eq!(retried.status, ExecutionStatus::Success);
        let record = engine.get_execution(&retried.execution_id).unwrap();
        assert_eq!(record.retry_of.as_deref(), Some(first.execution_id.as_str()));
        // prep was reused, not re-run
        assert_eq!(record.steps_for("prep").count(), 0);
        assert_eq!(output_of(&record, "calc")[0][0], json!({"ok": true, "n": 2}));
    }

    #[tokio::test]
    async fn test_stop_cancels_running_script() {
        let (engine, _) = engine_with(json!({
            "id": "wf",
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "spin", "type": "code", "parameters": {"code": "while true do end", "timeoutMs": 20000}}
            ],
            "connections": [{"sourceNodeId": "start", "targetNodeId": "spin"}]
        }))
        .await;

        let mut events = engine.subscribe();
        let summary = engine
            .execute(ExecutionRequest::manual("wf", vec![json!({})]).asynchronous())
            .await
            .unwrap();
        assert_eq!(summary.status, ExecutionStatus::Running);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(engine.stop(&summary.execution_id, "user request").unwrap());
        let record = engine
            .wait_for_completion(&summary.execution_id, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(record.status, ExecutionStatus::Canceled);
        assert!(!engine.stop(&summary.execution_id, "again").unwrap());

        let mut saw_started = false;
        while let Ok(event) = events.try_recv() {
            match event {
                ExecutionEvent::Started { .. } => saw_started = true,
                ExecutionEvent::Stopped { reason, .. } => {
                    assert!(saw_started);
                    assert_eq!(reason, "user request");
                }
                _ => {}
            }
        }
        assert!(saw_started);
    }

    #[tokio::test]
    async fn test_static_data_saved_on_success() {
        let (engine, registry) = engine_with(json!({
            "id": "wf",
            "staticData": {"runs": 1},
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "count", "type": "code", "parameters": {"code": "staticData.runs = staticData.runs + 1\nreturn items"}}
            ],
            "connections": [{"sourceNodeId": "start", "targetNodeId": "count"}]
        }))
        .await;

        let request = ExecutionRequest::manual("wf", vec![json!({})]).with_options(ExecutionOptions {
            load_static_data: true,
            ..Default::default()
        });
        engine.execute(request).await.unwrap();
        let stored = registry.get_workflow("wf").unwrap().workflow;
        assert_eq!(stored.static_data["runs"], json!(2));
    }

    #[tokio::test]
    async fn test_parallel_code_nodes_keep_each_others_static_data() {
        let (engine, registry) = engine_with(json!({
            "id": "wf",
            "staticData": {"shared": 0},
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "left", "type": "code", "parameters": {"code": "staticData.left = 'l'\nreturn items"}},
                {"id": "right", "type": "code", "parameters": {"code": "staticData.right = 'r'\nstaticData.shared = nil\nreturn items"}}
            ],
            "connections": [
                {"sourceNodeId": "start", "targetNodeId": "left"},
                {"sourceNodeId": "start", "targetNodeId": "right"}
            ]
        }))
        .await;

        let request = ExecutionRequest::manual("wf", vec![json!({})]).with_options(ExecutionOptions {
            load_static_data: true,
            ..Default::default()
        });
        assert_eq!(engine.execute(request).await.unwrap().status, ExecutionStatus::Success);
        let stored = registry.get_workflow("wf").unwrap().workflow;
        assert_eq!(stored.static_data.get("left"), Some(&json!("l")));
        assert_eq!(stored.static_data.get("right"), Some(&json!("r")));
        assert!(!stored.static_data.contains_key("shared"));
    }

    #[tokio::test]
    async fn test_destination_nodes_limit_run() {
        let (engine, _) = engine_with(json!({
            "id": "wf",
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "a", "type": "set", "parameters": {"values": {"a": 1}}},
                {"id": "b", "type": "set", "parameters": {"values": {"b": 1}}}
            ],
            "connections": [
                {"sourceNodeId": "start", "targetNodeId": "a"},
                {"sourceNodeId": "a", "targetNodeId": "b"}
            ]
        }))
        .await;

        let request = ExecutionRequest::manual("wf", vec![json!({})]).with_options(ExecutionOptions {
            destination_nodes: vec!["a".into()],
            ..Default::default()
        });
        let summary = engine.execute(request).await.unwrap();
        let record = engine.get_execution(&summary.execution_id).unwrap();
        assert!(record.run_data.contains_key("a"));
        assert!(!record.run_data.contains_key("b"));
        assert_eq!(record.steps_for("b").count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_workflow_and_start_node() {
        let (engine, _) = engine_with(json!({
            "id": "wf",
            "nodes": [{"id": "start", "type": "start"}],
            "connections": []
        }))
        .await;
        assert!(matches!(
            engine.execute(ExecutionRequest::manual("missing", vec![])).await,
            Err(EngineError::WorkflowNotFound(_))
        ));
        let request = ExecutionRequest::manual("wf", vec![]).with_options(ExecutionOptions {
            start_nodes: vec!["ghost".into()],
            ..Default::default()
        });
        assert!(matches!(engine.execute(request).await, Err(EngineError::InvalidRequest(_))));
    }
}
