/// Timers behind cron, interval and polling triggers
///
/// Cron triggers run on a shared tokio-cron-scheduler instance with a
/// key -> job UUID map, so re-activating a trigger replaces its job instead of
/// stacking a second one. Interval and polling triggers get their own tokio
/// task, stopped through a cancellation token.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::TriggerError;

use super::types::CronConfig;

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Work run on every cron tick
pub type JobCallback = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Hot-reload cron scheduler
pub struct CronScheduler {
    scheduler: RwLock<JobScheduler>,
    job_uuid_map: RwLock<HashMap<String, Uuid>>,
}

impl CronScheduler {
    pub async fn new() -> Result<Self, TriggerError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| TriggerError::Runtime(format!("Failed to create cron scheduler: {e}")))?;
        Ok(Self {
            scheduler: RwLock::new(scheduler),
            job_uuid_map: RwLock::new(HashMap::new()),
        })
    }

    pub async fn start(&self) -> Result<(), TriggerError> {
        tracing::info!("⏰ Starting cron scheduler");
        let scheduler = self.scheduler.read().await;
        scheduler
            .start()
            .await
            .map_err(|e| TriggerError::Runtime(format!("Failed to start cron scheduler: {e}")))
    }

    /// Adds the job under `key`, removing any job previously stored there.
    pub async fn add_or_replace(
        &self,
        key: &str,
        config: &CronConfig,
        callback: JobCallback,
    ) -> Result<(), TriggerError> {
        // STEP 1: Build the job first so an invalid schedule leaves the old one alone
        let job = Job::new_async_tz(config.expression.as_str(), config.timezone, move |_uuid, _l| {
            let callback = Arc::clone(&callback);
            Box::pin(async move { callback().await })
        })
        .map_err(|e| TriggerError::Configuration(format!("Invalid cron expression '{}': {e}", config.expression)))?;

        // STEP 2: Drop the previous job for this key
        self.remove(key).await;

        // STEP 3: Add and track the new one
        let job_uuid = {
            let scheduler = self.scheduler.read().await;
            scheduler
                .add(job)
                .await
                .map_err(|e| TriggerError::Runtime(format!("Failed to schedule cron job {key}: {e}")))?
        };
        self.job_uuid_map.write().await.insert(key.to_string(), job_uuid);

        tracing::debug!("🔥 Scheduled cron job {} ({} {})", key, config.expression, config.timezone);
        Ok(())
    }

    /// Removes the job stored under `key`. Returns whether one existed.
    pub async fn remove(&self, key: &str) -> bool {
        let Some(job_uuid) = self.job_uuid_map.write().await.remove(key) else {
            return false;
        };
        let scheduler = self.scheduler.read().await;
        if let Err(e) = scheduler.remove(&job_uuid).await {
            tracing::warn!("⚠️ Failed to remove cron job {} from scheduler: {}", key, e);
        } else {
            tracing::debug!("🛑 Removed cron job {}", key);
        }
        true
    }

    /// Number of jobs currently tracked.
    pub async fn job_count(&self) -> usize {
        self.job_uuid_map.read().await.len()
    }

    pub async fn shutdown(&self) -> Result<(), TriggerError> {
        tracing::info!("⏹️ Stopping cron scheduler");
        self.job_uuid_map.write().await.clear();
        let mut scheduler = self.scheduler.write().await;
        scheduler
            .shutdown()
            .await
            .map_err(|e| TriggerError::Runtime(format!("Failed to stop cron scheduler: {e}")))
    }
}

/// Accepts classic five-field expressions by prepending a seconds field.
///
/// Six and seven field expressions and `@hourly`-style shortcuts pass through.
pub fn normalize_cron_expression(raw: &str) -> Result<String, TriggerError> {
    let raw = raw.trim();
    let normalized = if raw.starts_with('@') {
        raw.to_string()
    } else {
        match raw.split_whitespace().count() {
            5 => format!("0 {}", raw.split_whitespace().collect::<Vec<_>>().join(" ")),
            6 | 7 => raw.split_whitespace().collect::<Vec<_>>().join(" "),
            n => {
                return Err(TriggerError::Configuration(format!(
                    "Cron expression '{raw}' has {n} fields, expected 5 to 7"
                )))
            }
        }
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| TriggerError::Configuration(format!("Invalid cron expression '{raw}': {e}")))?;
    Ok(normalized)
}

pub fn parse_timezone(name: &str) -> Result<Tz, TriggerError> {
    name.parse::<Tz>()
        .map_err(|_| TriggerError::Configuration(format!("Unknown timezone '{name}'")))
}

/// Next fire time strictly after `after`, evaluated in the trigger's timezone.
pub fn next_cron_tick(config: &CronConfig, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let schedule = cron::Schedule::from_str(&config.expression).ok()?;
    schedule
        .after(&after.with_timezone(&config.timezone))
        .next()
        .map(|next| next.with_timezone(&Utc))
}

/// Next fire time of a fixed period.
pub fn next_interval_tick(every: Duration, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(every).ok().map(|step| after + step)
}

/// Runs `tick` after `first_delay` and then every `every` until `cancel` fires.
///
/// Ticks never overlap: a slow tick delays the next one.
pub fn spawn_interval<F, Fut>(
    first_delay: Duration,
    every: Duration,
    cancel: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + first_delay, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => tick().await,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_normalize_cron_expression() {
        assert_eq!(normalize_cron_expression("*/5 * * * *").unwrap(), "0 */5 * * * *");
        assert_eq!(normalize_cron_expression("0  30 9 * * Mon-Fri").unwrap(), "0 30 9 * * Mon-Fri");
        assert!(normalize_cron_expression("@hourly").is_ok());
        assert!(matches!(
            normalize_cron_expression("61 * * * *"),
            Err(TriggerError::Configuration(_))
        ));
        assert!(normalize_cron_expression("* *").is_err());
    }

    #[test]
    fn test_next_cron_tick_respects_timezone() {
        let config = CronConfig {
            expression: "0 0 9 * * *".into(),
            timezone: chrono_tz::Asia::Tokyo,
        };
        // 2024-01-01 00:30 UTC is 09:30 in Tokyo, so the next 09:00 is the following day
        let after = Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap();
        let next = next_cron_tick(&config, after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_parse_timezone() {
        assert_eq!(parse_timezone("UTC").unwrap(), chrono_tz::UTC);
        assert!(parse_timezone("Mars/Olympus").is_err());
    }

    #[tokio::test]
    async fn test_add_or_replace_keeps_one_job_per_key() {
        let scheduler = CronScheduler::new().await.unwrap();
        let config = CronConfig {
            expression: "0 0 3 * * *".into(),
            timezone: chrono_tz::UTC,
        };
        let callback: JobCallback = Arc::new(|| -> JobFuture { Box::pin(async {}) });
        scheduler.add_or_replace("wf:cron", &config, Arc::clone(&callback)).await.unwrap();
        scheduler.add_or_replace("wf:cron", &config, callback).await.unwrap();
        assert_eq!(scheduler.job_count().await, 1);
        assert!(scheduler.remove("wf:cron").await);
        assert!(!scheduler.remove("wf:cron").await);
        assert_eq!(scheduler.job_count().await, 0);
    }

    #[tokio::test]
    async fn test_spawn_interval_stops_on_cancel() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let counter = Arc::clone(&ticks);
        let handle = spawn_interval(Duration::ZERO, Duration::from_millis(20), cancel.clone(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(110)).await;
        cancel.cancel();
        handle.await.unwrap();
        let seen = ticks.load(Ordering::SeqCst);
        assert!(seen >= 3, "only {seen} ticks");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }
}
