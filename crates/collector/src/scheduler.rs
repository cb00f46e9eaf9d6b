use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio_cron_scheduler::{Job, JobScheduler};

/// Accepts classic 5-field cron (`min hour dom month dow`) and the
/// seconds-first 6/7-field form; 5-field patterns fire at second 0.
pub fn normalize_cron_pattern(pattern: &str) -> Result<String> {
    let fields: Vec<&str> = pattern.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 | 7 => Ok(fields.join(" ")),
        n => anyhow::bail!("cron pattern '{pattern}' has {n} fields; expected 5, 6 or 7"),
    }
}

/// A running recurring trigger. Dropping it without [`CronTrigger::shutdown`]
/// leaves the job scheduled.
pub struct CronTrigger {
    scheduler: JobScheduler,
    pattern: String,
}

impl CronTrigger {
    pub async fn start<F, Fut>(pattern: &str, tick: F) -> Result<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let pattern = normalize_cron_pattern(pattern)?;
        let tick = Arc::new(tick);
        let job = Job::new_async(pattern.as_str(), move |_uuid, _l| {
            let tick = Arc::clone(&tick);
            Box::pin(async move {
                tracing::debug!("scheduler tick");
                tick().await;
            })
        })
        .with_context(|| format!("invalid cron pattern '{pattern}'"))?;

        let scheduler = JobScheduler::new()
            .await
            .context("failed to create job scheduler")?;
        scheduler.add(job).await.context("failed to add cron job")?;
        scheduler.start().await.context("failed to start job scheduler")?;

        Ok(Self { scheduler, pattern })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub async fn shutdown(mut self) -> Result<()> {
        self.scheduler
            .shutdown()
            .await
            .context("failed to stop job scheduler")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_five_field_patterns_gain_seconds() {
        assert_eq!(normalize_cron_pattern("* * * * *").unwrap(), "0 * * * * *");
        assert_eq!(
            normalize_cron_pattern("  */5  * * * *").unwrap(),
            "0 */5 * * * *"
        );
        assert_eq!(
            normalize_cron_pattern("*/10 * * * * *").unwrap(),
            "*/10 * * * * *"
        );
        assert!(normalize_cron_pattern("* *").is_err());
        assert!(normalize_cron_pattern("").is_err());
    }

    #[tokio::test]
    async fn test_invalid_pattern_rejected() {
        let res = CronTrigger::start("nonsense a b c d", || async {}).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_trigger_fires_and_stops() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let trigger = CronTrigger::start("* * * * * *", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();
        assert_eq!(trigger.pattern(), "* * * * * *");

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        trigger.shutdown().await.unwrap();
        let fired = hits.load(Ordering::SeqCst);
        assert!(fired >= 1, "expected at least one tick, got {fired}");

        // A tick already dispatched at shutdown may still land.
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(hits.load(Ordering::SeqCst) <= fired + 1);
    }
}
