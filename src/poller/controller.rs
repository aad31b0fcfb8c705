use std::sync::Arc;

use anyhow::{bail, Context, Result};
use log::info;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::context::SessionContext;

use super::loop_worker::{poll_loop, PollerConfig};

pub struct PollerController {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl PollerController {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    pub async fn start(&mut self, context: Arc<SessionContext>, config: PollerConfig) -> Result<()> {
        if self.handle.is_some() {
            bail!("page poller already running");
        }

        info!("Starting page poller every {:?}", config.interval);
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(poll_loop(context, config, cancel_token.clone()));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("page poller task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}
