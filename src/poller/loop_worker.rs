use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::context::SessionContext;
use crate::executor::ActionFailure;
use crate::models::LocatorSet;

const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    pub max_backoff_steps: u32,
    pub image: LocatorSet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PageSample {
    location: String,
    image_reference: Option<String>,
}

/// Extra wait after `streak` consecutive failed samples.
pub fn backoff_delay(streak: u32, interval: Duration, max_steps: u32) -> Duration {
    interval.saturating_mul(streak.min(max_steps))
}

pub async fn poll_loop(context: Arc<SessionContext>, config: PollerConfig, cancel_token: CancellationToken) {
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut last_seen: Option<PageSample> = None;
    let mut failure_streak: u32 = 0;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sample_page(&context, &config).await {
                    Ok(sample) => {
                        failure_streak = 0;
                        if last_seen.as_ref() != Some(&sample) {
                            log_debug!("page changed: {} ({:?})", sample.location, sample.image_reference);
                            refresh_instruction(&context).await;
                            last_seen = Some(sample);
                        }
                    }
                    Err(err) => {
                        failure_streak = failure_streak.saturating_add(1);
                        let pause = backoff_delay(failure_streak, config.interval, config.max_backoff_steps);
                        log_warn!("page sample failed ({} in a row), backing off {:?}: {err:#}", failure_streak, pause);
                        if cancelled_during(&cancel_token, pause).await {
                            break;
                        }
                    }
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("page poller shutting down");
                break;
            }
        }
    }
}

async fn cancelled_during(cancel_token: &CancellationToken, pause: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(pause) => false,
        _ = cancel_token.cancelled() => true,
    }
}

async fn sample_page(context: &SessionContext, config: &PollerConfig) -> Result<PageSample> {
    let location = context
        .executor
        .read_location()
        .await
        .map_err(|err| anyhow!("reading location failed: {err}"))?;

    // A page without a task image is a valid state, not a failed read.
    let image_reference = match context.executor.peek(&config.image.read_attribute("src")).await {
        Ok(reference) => Some(reference),
        Err(ActionFailure::NotFound) => None,
        Err(failure) => return Err(anyhow!("reading task image failed: {failure}")),
    };

    Ok(PageSample {
        location,
        image_reference,
    })
}

async fn refresh_instruction(context: &SessionContext) {
    if let Some(record) = context.pipeline.latest_record().await {
        if context.instructions.publish(&record.instruction_text) {
            log_info!(
                "Instruction buffer now holds {} #{}",
                record.date_bucket,
                record.sequence_number
            );
        }
    }
}
