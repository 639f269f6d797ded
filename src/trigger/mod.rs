/// Trigger orchestration
///
/// Turns trigger nodes into live schedules, timers, pollers and webhook
/// routes, and fires executions through the engine when they go off.

// Trigger records, lifecycle state machine and configuration parsing
pub mod types;

// Cron scheduler wrapper and interval timers
pub mod schedule;

// Change detection for polling triggers
pub mod polling;

// Webhook route table and request authentication
pub mod webhook;

// Lifecycle operations and the active-trigger registry
pub mod orchestrator;

pub use orchestrator::{TriggerOrchestrator, WebhookReply, WebhookRequest};
pub use types::{
    TriggerAction, TriggerFilter, TriggerRecord, TriggerRegistration, TriggerStatus, TriggerType,
};
pub use webhook::{RouteMatch, WebhookRoute, WebhookRoutes};
