//! Trigger orchestrator
//!
//! Owns the trigger records and the active-trigger registry (trigger id ->
//! live timer, cron job or webhook route). Lifecycle calls for one trigger id
//! are serialized through a per-id async lock, so two concurrent `activate`
//! calls can never leave two schedules behind.
//!
//! Fires go through [`WorkflowExecutionEngine::execute`]. A fire the engine
//! rejects (workflow gone or no longer valid) moves the trigger to Error and
//! tears its handle down.

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::TriggerSettings;
use crate::error::{EngineError, Result, TriggerError};
use crate::runtime::{ExecutionMode, ExecutionRecord, ExecutionRequest, ExecutionSummary, WorkflowExecutionEngine};
use crate::services::{CredentialVault, WorkflowRepository};
use crate::workflow::{validate, Item, NodeType, Workflow};

use super::polling::{self, PollState};
use super::schedule::{self, CronScheduler, JobCallback, JobFuture};
use super::types::{
    transition, CronConfig, FireSource, IntervalConfig, PollingConfig, ResponseMode, TriggerAction, TriggerFilter,
    TriggerRecord, TriggerRegistration, TriggerStatus, TriggerType, WebhookConfig,
};
use super::webhook::{self, WebhookRoute, WebhookRoutes};

/// Parsed configuration, ready to allocate
enum Plan {
    Cron(CronConfig),
    Interval(IntervalConfig),
    Polling(PollingConfig),
    Webhook(WebhookConfig),
    Manual,
}

/// How often a live trigger fires
#[derive(Clone)]
enum Cadence {
    Cron(CronConfig),
    Every(Duration),
    OnDemand,
}

impl Cadence {
    fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Cadence::Cron(config) => schedule::next_cron_tick(config, now),
            Cadence::Every(every) => schedule::next_interval_tick(*every, now),
            Cadence::OnDemand => None,
        }
    }
}

enum Resource {
    CronJob,
    Timer(CancellationToken),
    Route,
    Nothing,
}

/// Entry of the active-trigger registry
struct LiveHandle {
    resource: Resource,
    cadence: Cadence,
}

/// Inbound request for a webhook trigger
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub method: String,
    pub path: String,
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
    pub body: Value,
}

/// What the ingress should answer
#[derive(Debug, Clone)]
pub enum WebhookReply {
    /// `onReceived`: the execution started
    Started { execution_id: String },
    /// `lastNode`: the execution finished in time
    Finished(ExecutionRecord),
    /// `lastNode`: still running when the wait ran out
    Pending { execution_id: String },
    /// The trigger is paused
    Paused,
}

pub struct TriggerOrchestrator {
    engine: Arc<WorkflowExecutionEngine>,
    repository: Arc<dyn WorkflowRepository>,
    credentials: Arc<dyn CredentialVault>,
    scheduler: CronScheduler,
    routes: WebhookRoutes,
    client: reqwest::Client,
    settings: TriggerSettings,
    records: Mutex<HashMap<String, TriggerRecord>>,
    live: Mutex<HashMap<String, LiveHandle>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    me: Weak<TriggerOrchestrator>,
}

impl TriggerOrchestrator {
    pub async fn new(
        engine: Arc<WorkflowExecutionEngine>,
        repository: Arc<dyn WorkflowRepository>,
        credentials: Arc<dyn CredentialVault>,
        settings: TriggerSettings,
    ) -> Result<Arc<Self>> {
        let scheduler = CronScheduler::new().await?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.poll_timeout_ms))
            .build()
            .map_err(|e| EngineError::Collaborator(format!("Failed to build HTTP client: {e}")))?;
        Ok(Arc::new_cyclic(|me| Self {
            engine,
            repository,
            credentials,
            scheduler,
            routes: WebhookRoutes::new(),
            client,
            settings,
            records: Mutex::new(HashMap::new()),
            live: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            me: me.clone(),
        }))
    }

    /// Starts the cron scheduler and brings up the triggers of every active workflow.
    pub async fn start(&self) -> Result<usize> {
        self.scheduler.start().await?;
        self.load_active().await
    }

    pub fn routes(&self) -> &WebhookRoutes {
        &self.routes
    }

    /// Creates the Inactive record for a trigger node, or refreshes the
    /// configuration of the record already bound to that node.
    pub async fn register(&self, registration: TriggerRegistration) -> Result<String> {
        let workflow = self.load_workflow(&registration.workflow_id).await?;
        let node = workflow.node(&registration.node_id).ok_or_else(|| {
            TriggerError::Configuration(format!(
                "Node '{}' does not exist in workflow {}",
                registration.node_id, registration.workflow_id
            ))
        })?;
        if node.node_type.trigger_type() != Some(registration.trigger_type) {
            return Err(TriggerError::Configuration(format!(
                "Node '{}' of type {} cannot back a {} trigger",
                node.id, node.node_type, registration.trigger_type
            ))
            .into());
        }
        let configuration = registration
            .configuration
            .filter(|c| !c.is_null())
            .unwrap_or_else(|| node.parameters.clone());

        let mut records = self.records.lock();
        if let Some(existing) = records
            .values_mut()
            .find(|r| r.workflow_id == registration.workflow_id && r.node_id == registration.node_id)
        {
            existing.configuration = configuration;
            existing.trigger_type = registration.trigger_type;
            tracing::debug!("📝 Refreshed trigger {} for {}/{}", existing.id, existing.workflow_id, existing.node_id);
            return Ok(existing.id.clone());
        }

        let id = Uuid::new_v4().to_string();
        records.insert(
            id.clone(),
            TriggerRecord {
                id: id.clone(),
                workflow_id: registration.workflow_id,
                node_id: registration.node_id,
                trigger_type: registration.trigger_type,
                status: TriggerStatus::Inactive,
                configuration,
                last_triggered_at: None,
                next_trigger_at: None,
                trigger_count: 0,
                error_message: None,
                created_at: Utc::now(),
            },
        );
        tracing::info!("📝 Registered {} trigger {}", registration.trigger_type, id);
        Ok(id)
    }

    /// Allocates the live timer, job or route and moves the trigger to Active.
    ///
    /// Configuration problems reject the activation and leave no partial
    /// registration behind.
    pub async fn activate(&self, trigger_id: &str) -> Result<TriggerRecord> {
        let lock = self.key_lock(trigger_id);
        let _guard = lock.lock().await;

        let record = self.record(trigger_id)?;
        transition(trigger_id, record.status, TriggerAction::Activate)?;

        // STEP 1: The workflow must validate
        let workflow = self.load_workflow(&record.workflow_id).await?;
        let report = validate(&workflow);
        if !report.is_valid {
            return Err(TriggerError::Validation(report.errors).into());
        }

        // STEP 2: Parse before touching anything live
        let plan = self.plan(&record, &workflow)?;

        // STEP 3: Swap the live handle
        self.teardown(trigger_id).await;
        let handle = match self.allocate(&record, plan).await {
            Ok(handle) => handle,
            Err(err) => {
                self.update_record(trigger_id, |r| {
                    r.status = TriggerStatus::Inactive;
                    r.next_trigger_at = None;
                });
                return Err(err.into());
            }
        };
        let next = handle.cadence.next_after(Utc::now());
        self.live.lock().insert(trigger_id.to_string(), handle);

        tracing::info!(trigger_id, trigger_type = %record.trigger_type, "✅ Activated trigger for workflow {}", record.workflow_id);
        self.update_record(trigger_id, |r| {
            r.status = TriggerStatus::Active;
            r.next_trigger_at = next;
            r.error_message = None;
        })
        .ok_or_else(|| TriggerError::NotFound(trigger_id.to_string()).into())
    }

    /// Releases the live handle. Always removes the active-registry entry.
    pub async fn deactivate(&self, trigger_id: &str) -> Result<TriggerRecord> {
        let lock = self.key_lock(trigger_id);
        let _guard = lock.lock().await;

        let record = self.record(trigger_id)?;
        let next = transition(trigger_id, record.status, TriggerAction::Deactivate)?;
        self.teardown(trigger_id).await;

        tracing::info!(trigger_id, "⏹️ Deactivated trigger");
        self.update_record(trigger_id, |r| {
            r.status = next;
            r.next_trigger_at = None;
        })
        .ok_or_else(|| TriggerError::NotFound(trigger_id.to_string()).into())
    }

    /// Suspends firing. The live handle stays allocated.
    pub async fn pause(&self, trigger_id: &str) -> Result<TriggerRecord> {
        let lock = self.key_lock(trigger_id);
        let _guard = lock.lock().await;

        let record = self.record(trigger_id)?;
        let next = transition(trigger_id, record.status, TriggerAction::Pause)?;
        tracing::info!(trigger_id, "⏸️ Paused trigger");
        self.update_record(trigger_id, |r| {
            r.status = next;
            r.next_trigger_at = None;
        })
        .ok_or_else(|| TriggerError::NotFound(trigger_id.to_string()).into())
    }

    pub async fn resume(&self, trigger_id: &str) -> Result<TriggerRecord> {
        let lock = self.key_lock(trigger_id);
        let _guard = lock.lock().await;

        let record = self.record(trigger_id)?;
        let next_status = transition(trigger_id, record.status, TriggerAction::Resume)?;
        let next_at = self.next_fire(trigger_id);
        tracing::info!(trigger_id, "▶️ Resumed trigger");
        self.update_record(trigger_id, |r| {
            r.status = next_status;
            r.next_trigger_at = next_at;
        })
        .ok_or_else(|| TriggerError::NotFound(trigger_id.to_string()).into())
    }

    /// Forces the trigger into Error and tears its handle down.
    pub async fn record_error(&self, trigger_id: &str, message: impl Into<String>) -> Result<TriggerRecord> {
        let lock = self.key_lock(trigger_id);
        let _guard = lock.lock().await;

        self.record(trigger_id)?;
        self.teardown(trigger_id).await;
        let message = message.into();
        tracing::error!(trigger_id, "💥 Trigger failed: {}", message);
        self.update_record(trigger_id, |r| {
            r.status = TriggerStatus::Error;
            r.error_message = Some(message);
            r.next_trigger_at = None;
        })
        .ok_or_else(|| TriggerError::NotFound(trigger_id.to_string()).into())
    }

    /// Deactivates and forgets a trigger. Returns false for unknown ids.
    pub async fn unregister(&self, trigger_id: &str) -> bool {
        let lock = self.key_lock(trigger_id);
        let removed = {
            let _guard = lock.lock().await;
            self.teardown(trigger_id).await;
            self.records.lock().remove(trigger_id).is_some()
        };
        self.locks.lock().remove(trigger_id);
        if removed {
            tracing::info!(trigger_id, "🗑️ Removed trigger");
        }
        removed
    }

    pub fn get(&self, trigger_id: &str) -> Option<TriggerRecord> {
        self.records.lock().get(trigger_id).cloned()
    }

    /// Records matching `filter`, oldest first.
    pub fn list(&self, filter: &TriggerFilter) -> Vec<TriggerRecord> {
        let mut records: Vec<TriggerRecord> = self
            .records
            .lock()
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    /// Ids of triggers holding a live handle.
    pub fn active_trigger_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.live.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn scheduled_jobs(&self) -> usize {
        self.scheduler.job_count().await
    }

    /// Fires an Active trigger on demand (manual triggers, or testing any kind).
    pub async fn fire_manual(&self, trigger_id: &str, input: Option<Vec<Item>>) -> Result<ExecutionSummary> {
        let record = self.record(trigger_id)?;
        if record.status != TriggerStatus::Active {
            return Err(TriggerError::InvalidTransition {
                trigger_id: trigger_id.to_string(),
                from: record.status.to_string(),
                action: "fire",
            }
            .into());
        }
        let input = input.unwrap_or_else(|| vec![json!({})]);
        self.fire(trigger_id, FireSource::Manual, input)
            .await?
            .ok_or_else(|| TriggerError::NotFound(trigger_id.to_string()).into())
    }

    /// Runs an inbound webhook request through its trigger.
    pub async fn handle_webhook(&self, route: &WebhookRoute, request: WebhookRequest) -> Result<WebhookReply> {
        webhook::verify_auth(&route.config.auth, &request.headers, self.credentials.as_ref()).await?;

        let input = webhook::build_input(&request.method, &request.path, &request.headers, request.query, request.body);
        let Some(summary) = self.fire(&route.trigger_id, FireSource::Webhook, vec![input]).await? else {
            return Ok(WebhookReply::Paused);
        };

        match route.config.response_mode {
            ResponseMode::OnReceived => Ok(WebhookReply::Started {
                execution_id: summary.execution_id,
            }),
            ResponseMode::LastNode => {
                let wait = Duration::from_millis(self.settings.webhook_response_timeout_ms);
                let record = self
                    .engine
                    .wait_for_completion(&summary.execution_id, Some(wait))
                    .await?;
                if record.status.is_finished() {
                    Ok(WebhookReply::Finished(record))
                } else {
                    Ok(WebhookReply::Pending {
                        execution_id: summary.execution_id,
                    })
                }
            }
        }
    }

    /// Brings a workflow's triggers in line with its current definition.
    ///
    /// Triggers whose node disappeared (or whose workflow is inactive or gone)
    /// are removed; every enabled trigger node of an active workflow is
    /// registered and activated. Activation failures are kept on the record.
    pub async fn sync_workflow(&self, workflow_id: &str) -> Result<Vec<TriggerRecord>> {
        let workflow = self.repository.find_by_id(workflow_id).await?;
        let wanted: Vec<(String, TriggerType)> = match &workflow {
            Some(workflow) if workflow.active => workflow
                .trigger_nodes()
                .filter(|node| node.node_type != NodeType::Start && !node.disabled)
                .filter_map(|node| node.node_type.trigger_type().map(|t| (node.id.clone(), t)))
                .collect(),
            _ => Vec::new(),
        };

        // STEP 1: Drop stale triggers
        let stale: Vec<String> = self
            .list(&TriggerFilter {
                workflow_id: Some(workflow_id.to_string()),
                ..Default::default()
            })
            .into_iter()
            .filter(|r| !wanted.iter().any(|(node_id, t)| *node_id == r.node_id && *t == r.trigger_type))
            .map(|r| r.id)
            .collect();
        for id in stale {
            self.unregister(&id).await;
        }

        // STEP 2: Register and (re)activate the rest
        let mut synced = Vec::with_capacity(wanted.len());
        for (node_id, trigger_type) in wanted {
            let id = self
                .register(TriggerRegistration {
                    workflow_id: workflow_id.to_string(),
                    node_id,
                    trigger_type,
                    configuration: None,
                })
                .await?;
            // Live triggers are rebuilt from the new definition
            if matches!(
                self.get(&id).map(|r| r.status),
                Some(TriggerStatus::Active | TriggerStatus::Paused)
            ) {
                self.deactivate(&id).await?;
            }
            match self.activate(&id).await {
                Ok(record) => synced.push(record),
                Err(e) => {
                    tracing::warn!(trigger_id = %id, "⚠️ Failed to activate trigger: {}", e);
                    if let Some(mut record) = self.get(&id) {
                        record.error_message = Some(e.to_string());
                        synced.push(record);
                    }
                }
            }
        }
        Ok(synced)
    }

    /// Deactivates and forgets every trigger of a workflow.
    pub async fn remove_workflow_triggers(&self, workflow_id: &str) -> usize {
        let ids: Vec<String> = self
            .records
            .lock()
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .map(|r| r.id.clone())
            .collect();
        let mut removed = 0;
        for id in ids {
            if self.unregister(&id).await {
                removed += 1;
            }
        }
        removed
    }

    /// Activates the triggers of every active workflow. Returns how many are live.
    pub async fn load_active(&self) -> Result<usize> {
        let workflows = self.repository.find_active().await?;
        let mut live = 0;
        for workflow in &workflows {
            match self.sync_workflow(&workflow.id).await {
                Ok(records) => live += records.iter().filter(|r| r.status == TriggerStatus::Active).count(),
                Err(e) => tracing::warn!("⚠️ Failed to load triggers of workflow {}: {}", workflow.id, e),
            }
        }
        tracing::info!("📊 Loaded {} triggers from {} active workflows", live, workflows.len());
        Ok(live)
    }

    /// Deactivates every trigger and stops the cron scheduler.
    ///
    /// Live triggers end up Inactive; Error and Inactive records keep their
    /// status and only lose whatever handle is left.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.records.lock().keys().cloned().collect();
        tracing::info!("⏹️ Deactivating {} triggers", ids.len());
        for id in ids {
            let lock = self.key_lock(&id);
            let _guard = lock.lock().await;
            self.teardown(&id).await;
            self.update_record(&id, |r| {
                if matches!(r.status, TriggerStatus::Active | TriggerStatus::Paused) {
                    r.status = TriggerStatus::Inactive;
                }
                r.next_trigger_at = None;
            });
        }
        if let Err(e) = self.scheduler.shutdown().await {
            tracing::warn!("⚠️ {}", e);
        }
    }

    fn key_lock(&self, trigger_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks.lock().entry(trigger_id.to_string()).or_default())
    }

    fn record(&self, trigger_id: &str) -> std::result::Result<TriggerRecord, TriggerError> {
        self.get(trigger_id)
            .ok_or_else(|| TriggerError::NotFound(trigger_id.to_string()))
    }

    fn update_record(&self, trigger_id: &str, apply: impl FnOnce(&mut TriggerRecord)) -> Option<TriggerRecord> {
        let mut records = self.records.lock();
        let record = records.get_mut(trigger_id)?;
        apply(record);
        Some(record.clone())
    }

    fn next_fire(&self, trigger_id: &str) -> Option<DateTime<Utc>> {
        self.live
            .lock()
            .get(trigger_id)
            .and_then(|handle| handle.cadence.next_after(Utc::now()))
    }

    async fn load_workflow(&self, workflow_id: &str) -> Result<Arc<Workflow>> {
        self.repository
            .find_by_id(workflow_id)
            .await?
            .ok_or_else(|| TriggerError::Configuration(format!("Workflow {workflow_id} does not exist")).into())
    }

    fn plan(&self, record: &TriggerRecord, workflow: &Workflow) -> std::result::Result<Plan, TriggerError> {
        let min = Duration::from_millis(self.settings.min_interval_ms);
        let config = &record.configuration;
        Ok(match record.trigger_type {
            TriggerType::Cron => {
                let timezone = workflow
                    .settings
                    .timezone
                    .as_deref()
                    .unwrap_or(&self.settings.default_timezone);
                Plan::Cron(CronConfig::parse(config, timezone)?)
            }
            TriggerType::Interval => Plan::Interval(IntervalConfig::parse(config, min)?),
            TriggerType::Polling => Plan::Polling(PollingConfig::parse(config, min)?),
            TriggerType::Webhook => Plan::Webhook(WebhookConfig::parse(config)?),
            TriggerType::Manual => Plan::Manual,
        })
    }

    async fn allocate(&self, record: &TriggerRecord, plan: Plan) -> std::result::Result<LiveHandle, TriggerError> {
        let trigger_id = record.id.clone();
        Ok(match plan {
            Plan::Cron(config) => {
                self.scheduler
                    .add_or_replace(&trigger_id, &config, self.cron_callback(&trigger_id))
                    .await?;
                LiveHandle {
                    resource: Resource::CronJob,
                    cadence: Cadence::Cron(config),
                }
            }
            Plan::Interval(config) => {
                let cancel = CancellationToken::new();
                let me = self.me.clone();
                schedule::spawn_interval(config.every, config.every, cancel.clone(), move || {
                    let me = me.clone();
                    let trigger_id = trigger_id.clone();
                    async move {
                        if let Some(orchestrator) = me.upgrade() {
                            let input = vec![tick_item(&trigger_id)];
                            orchestrator.fire_scheduled(&trigger_id, FireSource::Interval, input).await;
                        }
                    }
                });
                LiveHandle {
                    resource: Resource::Timer(cancel),
                    cadence: Cadence::Every(config.every),
                }
            }
            Plan::Polling(config) => {
                let cancel = CancellationToken::new();
                let every = config.every;
                self.spawn_poller(trigger_id, config, cancel.clone());
                LiveHandle {
                    resource: Resource::Timer(cancel),
                    cadence: Cadence::Every(every),
                }
            }
            Plan::Webhook(config) => {
                self.routes.register(WebhookRoute {
                    trigger_id,
                    workflow_id: record.workflow_id.clone(),
                    node_id: record.node_id.clone(),
                    config,
                })?;
                LiveHandle {
                    resource: Resource::Route,
                    cadence: Cadence::OnDemand,
                }
            }
            Plan::Manual => LiveHandle {
                resource: Resource::Nothing,
                cadence: Cadence::OnDemand,
            },
        })
    }

    fn spawn_poller(&self, trigger_id: String, config: PollingConfig, cancel: CancellationToken) {
        let me = self.me.clone();
        let client = self.client.clone();
        let timeout = Duration::from_millis(self.settings.poll_timeout_ms);
        let state = Arc::new(Mutex::new(PollState::new()));
        let config = Arc::new(config);
        let every = config.every;

        // First poll right away to take the baseline
        schedule::spawn_interval(Duration::ZERO, every, cancel, move || {
            let me = me.clone();
            let trigger_id = trigger_id.clone();
            let client = client.clone();
            let state = Arc::clone(&state);
            let config = Arc::clone(&config);
            async move {
                let Some(orchestrator) = me.upgrade() else {
                    return;
                };
                if orchestrator.get(&trigger_id).map(|r| r.status) == Some(TriggerStatus::Paused) {
                    return;
                }
                match polling::fetch(&client, &config, timeout).await {
                    Ok(current) => {
                        let change = state.lock().observe(current);
                        if let Some(change) = change {
                            tracing::info!(trigger_id = %trigger_id, paths = ?change.changed_paths, "🔎 Polled data changed");
                            orchestrator
                                .fire_scheduled(&trigger_id, FireSource::Polling, vec![change.into_item()])
                                .await;
                        }
                    }
                    Err(e) => tracing::warn!(trigger_id = %trigger_id, "⚠️ {}", e),
                }
            }
        });
    }

    fn cron_callback(&self, trigger_id: &str) -> JobCallback {
        let me = self.me.clone();
        let trigger_id = trigger_id.to_string();
        Arc::new(move || -> JobFuture {
            let me = me.clone();
            let trigger_id = trigger_id.clone();
            Box::pin(async move {
                if let Some(orchestrator) = me.upgrade() {
                    let input = vec![tick_item(&trigger_id)];
                    orchestrator.fire_scheduled(&trigger_id, FireSource::Cron, input).await;
                }
            })
        })
    }

    /// Releases whatever the trigger holds and drops it from the active registry.
    async fn teardown(&self, trigger_id: &str) -> bool {
        let Some(handle) = self.live.lock().remove(trigger_id) else {
            return false;
        };
        match handle.resource {
            Resource::CronJob => {
                self.scheduler.remove(trigger_id).await;
            }
            Resource::Timer(cancel) => cancel.cancel(),
            Resource::Route => {
                self.routes.unregister(trigger_id);
            }
            Resource::Nothing => {}
        }
        true
    }

    async fn fire_scheduled(&self, trigger_id: &str, source: FireSource, input: Vec<Item>) {
        if let Err(e) = self.fire(trigger_id, source, input).await {
            tracing::error!(trigger_id, source = source.as_str(), "❌ Trigger fire failed: {}", e);
        }
    }

    /// Starts an execution for an Active trigger. `None` when the trigger is
    /// not Active (paused, or torn down while the tick was in flight).
    async fn fire(&self, trigger_id: &str, source: FireSource, input: Vec<Item>) -> Result<Option<ExecutionSummary>> {
        let (workflow_id, node_id, trigger_type) = match self.get(trigger_id) {
            Some(r) if r.status == TriggerStatus::Active => (r.workflow_id, r.node_id, r.trigger_type),
            Some(r) => {
                tracing::debug!(trigger_id, "⏭️ Skipping fire of {} trigger", r.status);
                return Ok(None);
            }
            None => return Ok(None),
        };

        let mode = match source {
            FireSource::Webhook => ExecutionMode::Webhook,
            FireSource::Manual => ExecutionMode::Manual,
            _ => ExecutionMode::Trigger,
        };
        tracing::info!(trigger_id, trigger_type = %trigger_type, "🔔 Trigger fired for workflow {}", workflow_id);

        let request = ExecutionRequest::from_trigger(&workflow_id, node_id, mode, source.as_str(), input);
        match self.engine.execute(request).await {
            Ok(summary) => {
                let next = self.next_fire(trigger_id);
                self.update_record(trigger_id, |r| {
                    r.trigger_count += 1;
                    r.last_triggered_at = Some(Utc::now());
                    if r.status == TriggerStatus::Active {
                        r.next_trigger_at = next;
                    }
                });
                Ok(Some(summary))
            }
            Err(err) => {
                if let Err(record_err) = self
                    .record_error(trigger_id, format!("Failed to start workflow {workflow_id}: {err}"))
                    .await
                {
                    tracing::warn!("⚠️ Could not mark trigger {} as failed: {}", trigger_id, record_err);
                }
                Err(err)
            }
        }
    }
}

fn tick_item(trigger_id: &str) -> Item {
    json!({ "timestamp": Utc::now().to_rfc3339(), "triggerId": trigger_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::runtime::{ExecutionStatus, NodeExecutor, Sandbox};
    use crate::services::{LayeredVariables, NoopHistory, StaticCredentialVault};
    use crate::workflow::WorkflowRegistry;

    async fn setup(workflow: Value) -> (Arc<TriggerOrchestrator>, Arc<WorkflowRegistry>, Arc<WorkflowExecutionEngine>) {
        let registry = Arc::new(WorkflowRegistry::in_memory());
        registry
            .register(serde_json::from_value(workflow).unwrap())
            .await
            .unwrap();
        let config = Config::default();
        let executor = NodeExecutor::new(
            Sandbox::default(),
            Arc::new(StaticCredentialVault::new()),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        let repository: Arc<dyn WorkflowRepository> = registry.clone();
        let engine = Arc::new(WorkflowExecutionEngine::new(
            Arc::clone(&repository),
            Arc::new(executor),
            Arc::new(LayeredVariables::new()),
            Arc::new(NoopHistory),
            &config.engine,
        ));
        let settings = TriggerSettings {
            min_interval_ms: 10,
            ..config.triggers
        };
        let orchestrator = TriggerOrchestrator::new(
            Arc::clone(&engine),
            repository,
            Arc::new(StaticCredentialVault::new()),
            settings,
        )
        .await
        .unwrap();
        (orchestrator, registry, engine)
    }

    fn workflow_with(trigger: Value) -> Value {
        json!({
            "id": "wf",
            "active": true,
            "nodes": [
                trigger,
                {"id": "mark", "type": "set", "parameters": {"values": {"seen": true}}}
            ],
            "connections": [{"sourceNodeId": "trigger", "targetNodeId": "mark"}]
        })
    }

    fn registration(trigger_type: TriggerType, configuration: Option<Value>) -> TriggerRegistration {
        TriggerRegistration {
            workflow_id: "wf".into(),
            node_id: "trigger".into(),
            trigger_type,
            configuration,
        }
    }

    #[tokio::test]
    async fn test_invalid_cron_rejected_and_stays_inactive() {
        let (orchestrator, _, _) = setup(workflow_with(
            json!({"id": "trigger", "type": "cronTrigger", "parameters": {"expression": "not a cron"}}),
        ))
        .await;
        let id = orchestrator.register(registration(TriggerType::Cron, None)).await.unwrap();

        let err = orchestrator.activate(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::Trigger(TriggerError::Configuration(_))), "{err}");
        assert_eq!(orchestrator.get(&id).unwrap().status, TriggerStatus::Inactive);
        assert_eq!(orchestrator.scheduled_jobs().await, 0);
        assert!(orchestrator.active_trigger_ids().is_empty());
    }

    #[tokio::test]
    async fn test_double_activate_keeps_single_schedule() {
        let (orchestrator, _, _) = setup(workflow_with(
            json!({"id": "trigger", "type": "cronTrigger", "parameters": {"expression": "0 0 4 * * *", "timezone": "Europe/Paris"}}),
        ))
        .await;
        let id = orchestrator.register(registration(TriggerType::Cron, None)).await.unwrap();

        let first = orchestrator.activate(&id).await.unwrap();
        assert_eq!(first.status, TriggerStatus::Active);
        assert!(first.next_trigger_at.unwrap() > Utc::now());
        let err = orchestrator.activate(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::Trigger(TriggerError::InvalidTransition { .. })), "{err}");
        assert_eq!(orchestrator.scheduled_jobs().await, 1);

        let paused = orchestrator.pause(&id).await.unwrap();
        assert_eq!(paused.status, TriggerStatus::Paused);
        assert!(paused.next_trigger_at.is_none());
        assert!(orchestrator.resume(&id).await.unwrap().next_trigger_at.is_some());

        orchestrator.deactivate(&id).await.unwrap();
        assert_eq!(orchestrator.scheduled_jobs().await, 0);
        assert!(orchestrator.active_trigger_ids().is_empty());
    }

    #[tokio::test]
    async fn test_interval_fires_and_counts() {
        let (orchestrator, _, engine) = setup(workflow_with(
            json!({"id": "trigger", "type": "intervalTrigger", "parameters": {"intervalMs": 30}}),
        ))
        .await;
        let mut events = engine.subscribe();
        let id = orchestrator.register(registration(TriggerType::Interval, None)).await.unwrap();
        orchestrator.activate(&id).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap();
        assert!(matches!(event, crate::runtime::ExecutionEvent::Started { mode: ExecutionMode::Trigger, .. }));

        orchestrator.deactivate(&id).await.unwrap();
        let record = orchestrator.get(&id).unwrap();
        assert!(record.trigger_count >= 1);
        assert!(record.last_triggered_at.is_some());
        assert_eq!(record.status, TriggerStatus::Inactive);
    }

    #[tokio::test]
    async fn test_fire_on_removed_workflow_moves_to_error() {
        let (orchestrator, registry, _) = setup(workflow_with(
            json!({"id": "trigger", "type": "manualTrigger"}),
        ))
        .await;
        let id = orchestrator.register(registration(TriggerType::Manual, None)).await.unwrap();
        orchestrator.activate(&id).await.unwrap();

        let summary = orchestrator.fire_manual(&id, Some(vec![json!({"x": 1})])).await.unwrap();
        assert_eq!(summary.status, ExecutionStatus::Running);

        registry.remove_workflow("wf").await.unwrap();
        assert!(orchestrator.fire_manual(&id, None).await.is_err());
        let record = orchestrator.get(&id).unwrap();
        assert_eq!(record.status, TriggerStatus::Error);
        assert!(record.error_message.unwrap().contains("wf"));

        // Error only leaves through activate, which needs the workflow back
        for refused in [
            orchestrator.resume(&id).await,
            orchestrator.pause(&id).await,
            orchestrator.deactivate(&id).await,
        ] {
            assert!(
                matches!(refused, Err(EngineError::Trigger(TriggerError::InvalidTransition { .. }))),
                "{refused:?}"
            );
        }
        assert_eq!(orchestrator.get(&id).unwrap().status, TriggerStatus::Error);
        assert!(orchestrator.activate(&id).await.is_err());
        assert_eq!(orchestrator.get(&id).unwrap().status, TriggerStatus::Error);
    }

    #[tokio::test]
    async fn test_error_leaves_only_through_activate() {
        let (orchestrator, _, _) = setup(workflow_with(
            json!({"id": "trigger", "type": "manualTrigger"}),
        ))
        .await;
        let id = orchestrator.register(registration(TriggerType::Manual, None)).await.unwrap();
        orchestrator.activate(&id).await.unwrap();
        orchestrator.record_error(&id, "upstream gone").await.unwrap();

        let err = orchestrator.deactivate(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::Trigger(TriggerError::InvalidTransition { .. })), "{err}");
        assert_eq!(orchestrator.get(&id).unwrap().status, TriggerStatus::Error);

        let record = orchestrator.activate(&id).await.unwrap();
        assert_eq!(record.status, TriggerStatus::Active);
        assert!(record.error_message.is_none());

        orchestrator.record_error(&id, "again").await.unwrap();
        orchestrator.shutdown().await;
        assert_eq!(orchestrator.get(&id).unwrap().status, TriggerStatus::Error);
        assert!(orchestrator.unregister(&id).await);
    }

    #[tokio::test]
    async fn test_sync_workflow_rebuilds_live_trigger() {
        let (orchestrator, registry, _) = setup(workflow_with(
            json!({"id": "trigger", "type": "webhookTrigger", "parameters": {"path": "/before"}}),
        ))
        .await;
        let first = orchestrator.sync_workflow("wf").await.unwrap();
        assert_eq!(first[0].status, TriggerStatus::Active);

        let mut workflow = (*registry.get_workflow("wf").unwrap().workflow).clone();
        workflow.nodes[0].parameters = json!({"path": "/after"});
        registry.register(workflow).await.unwrap();
        let second = orchestrator.sync_workflow("wf").await.unwrap();
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].status, TriggerStatus::Active);
        assert_eq!(second[0].configuration["path"], json!("/after"));
        assert_eq!(orchestrator.routes().len(), 1);
    }

    #[tokio::test]
    async fn test_register_rejects_mismatched_node() {
        let (orchestrator, _, _) = setup(workflow_with(
            json!({"id": "trigger", "type": "manualTrigger"}),
        ))
        .await;
        assert!(orchestrator.register(registration(TriggerType::Cron, None)).await.is_err());
        let first = orchestrator.register(registration(TriggerType::Manual, None)).await.unwrap();
        let again = orchestrator
            .register(registration(TriggerType::Manual, Some(json!({"note": "v2"}))))
            .await
            .unwrap();
        assert_eq!(first, again);
        assert_eq!(orchestrator.get(&first).unwrap().configuration, json!({"note": "v2"}));
    }

    #[tokio::test]
    async fn test_sync_workflow_replaces_triggers() {
        let (orchestrator, registry, _) = setup(workflow_with(
            json!({"id": "trigger", "type": "webhookTrigger", "parameters": {"path": "/hook"}}),
        ))
        .await;
        let records = orchestrator.sync_workflow("wf").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, TriggerStatus::Active);
        assert_eq!(orchestrator.routes().len(), 1);

        let mut workflow = (*registry.get_workflow("wf").unwrap().workflow).clone();
        workflow.active = false;
        registry.register(workflow).await.unwrap();
        assert!(orchestrator.sync_workflow("wf").await.unwrap().is_empty());
        assert!(orchestrator.routes().is_empty());
        assert!(orchestrator.list(&TriggerFilter::default()).is_empty());
    }
}
