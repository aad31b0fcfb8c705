//! Hand-off to the secondary (assistant) browser session.
//!
//! The session is opened on first use and kept until someone explicitly
//! restarts or closes it. Dropping the bridge leaves the browser running so
//! the operator keeps their assistant login and conversation.

pub mod assistant;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::driver::{DriverError, PageDriver};
use crate::storage::RESULTS_DIR;

pub use assistant::{AssistantFactory, AssistantSession, AssistantSettings};

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BridgeError {
    #[error("assistant session unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeOutcome {
    Delivered(PathBuf),
    Failed(String),
}

/// A second page session that can also run the assistant round trip.
#[async_trait]
pub trait SecondarySession: PageDriver {
    /// Sends `artifact` with `instruction` and saves what comes back into
    /// `results_dir`. Returns the first saved artifact.
    async fn submit(
        &self,
        artifact: &Path,
        instruction: &str,
        results_dir: &Path,
    ) -> anyhow::Result<PathBuf>;

    async fn close(&self) -> Result<(), DriverError>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> anyhow::Result<Arc<dyn SecondarySession>>;
}

pub struct AutomationBridge {
    factory: Arc<dyn SessionFactory>,
    session: Mutex<Option<Arc<dyn SecondarySession>>>,
}

impl AutomationBridge {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            session: Mutex::new(None),
        }
    }

    pub async fn is_active(&self) -> bool {
        self.session.lock().await.is_some()
    }

    /// Results land next to the artifact, in the slot's `results/` folder.
    pub async fn submit(&self, artifact: &Path, instruction: &str) -> Result<BridgeOutcome, BridgeError> {
        let results_dir = artifact
            .parent()
            .map(|slot| slot.join(RESULTS_DIR))
            .unwrap_or_else(|| PathBuf::from(RESULTS_DIR));

        // Held for the whole round trip; the assistant page handles one
        // conversation turn at a time.
        let mut guard = self.session.lock().await;
        let session = match guard.as_ref() {
            Some(session) => session.clone(),
            None => {
                let session = self.open_session().await?;
                *guard = Some(session.clone());
                session
            }
        };

        match session.submit(artifact, instruction, &results_dir).await {
            Ok(produced) => {
                log_info!("Assistant produced {}", produced.display());
                Ok(BridgeOutcome::Delivered(produced))
            }
            Err(err) => {
                log_warn!("Assistant round trip for {} failed: {:#}", artifact.display(), err);
                Ok(BridgeOutcome::Failed(format!("{err:#}")))
            }
        }
    }

    pub async fn restart(&self) -> Result<(), BridgeError> {
        let mut guard = self.session.lock().await;
        if let Some(previous) = guard.take() {
            close_quietly(previous.as_ref()).await;
        }
        *guard = Some(self.open_session().await?);
        log_info!("Assistant session restarted");
        Ok(())
    }

    /// Returns false when there was nothing to close.
    pub async fn close(&self) -> bool {
        let Some(session) = self.session.lock().await.take() else {
            return false;
        };
        close_quietly(session.as_ref()).await;
        log_info!("Assistant session closed");
        true
    }

    async fn open_session(&self) -> Result<Arc<dyn SecondarySession>, BridgeError> {
        self.factory.open().await.map_err(|err| {
            log_warn!("Could not open assistant session: {:#}", err);
            BridgeError::Unavailable(format!("{err:#}"))
        })
    }
}

async fn close_quietly(session: &dyn SecondarySession) {
    if let Err(err) = session.close().await {
        log_warn!("Closing assistant session failed: {}", err);
    }
}
