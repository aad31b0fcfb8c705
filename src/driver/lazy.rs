use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;

use super::{BrowserLaunch, DriverError, ElementHandle, PageDriver, WebDriverSession};
use crate::models::Locator;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Upper bound for attaching or launching, navigation to the start page included.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Clone)]
struct ConnectTarget {
    endpoint: String,
    session_id: Option<String>,
    launch: BrowserLaunch,
    start_url: Option<String>,
}

type PendingConnect = JoinHandle<Result<WebDriverSession, DriverError>>;

/// Main-page driver that connects on first use.
///
/// The panel window should come up even when chromedriver is not running
/// yet; until a connection succeeds every call fails with a transport error
/// and the next call tries again.
///
/// The connection runs in its own task. A caller that gives up early (the
/// executor bounds every call) leaves it running, and the next caller waits
/// on the same attempt, so a slow browser launch still yields one session.
pub struct LazySession {
    target: Arc<ConnectTarget>,
    session: OnceCell<WebDriverSession>,
    pending: Mutex<Option<PendingConnect>>,
}

impl LazySession {
    pub fn new(
        endpoint: String,
        session_id: Option<String>,
        launch: BrowserLaunch,
        start_url: Option<String>,
    ) -> Self {
        Self {
            target: Arc::new(ConnectTarget {
                endpoint,
                session_id,
                launch,
                start_url,
            }),
            session: OnceCell::new(),
            pending: Mutex::new(None),
        }
    }

    async fn session(&self) -> Result<&WebDriverSession, DriverError> {
        if let Some(session) = self.session.get() {
            return Ok(session);
        }

        let mut pending = self.pending.lock().await;
        if let Some(session) = self.session.get() {
            return Ok(session);
        }

        let attempt = pending.get_or_insert_with(|| tokio::spawn(connect(self.target.clone())));
        let joined = attempt.await;
        // Only reached once the attempt finished; a cancelled caller leaves it pending.
        *pending = None;

        let connected = joined.map_err(|err| DriverError::Transport(format!("connect task failed: {err}")))??;
        let _ = self.session.set(connected);
        drop(pending);

        self.session
            .get()
            .ok_or_else(|| DriverError::Transport("session vanished after connect".into()))
    }
}

async fn connect(target: Arc<ConnectTarget>) -> Result<WebDriverSession, DriverError> {
    let result = match tokio::time::timeout(CONNECT_TIMEOUT, open(&target)).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout),
    };
    match &result {
        Ok(session) => log_info!("Page session {} ready", session.session_id()),
        Err(err) => log_warn!("Could not reach WebDriver at {}: {}", target.endpoint, err),
    }
    result
}

async fn open(target: &ConnectTarget) -> Result<WebDriverSession, DriverError> {
    match &target.session_id {
        Some(id) => WebDriverSession::attach(&target.endpoint, id).await,
        None => {
            let session = WebDriverSession::create(&target.endpoint, &target.launch).await?;
            if let Some(url) = &target.start_url {
                session.navigate(url).await?;
            }
            Ok(session)
        }
    }
}

#[async_trait]
impl PageDriver for LazySession {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.session().await?.navigate(url).await
    }

    async fn locate(&self, locator: &Locator) -> Result<ElementHandle, DriverError> {
        self.session().await?.locate(locator).await
    }

    async fn locate_all(&self, locator: &Locator) -> Result<Vec<ElementHandle>, DriverError> {
        self.session().await?.locate_all(locator).await
    }

    async fn read_attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, DriverError> {
        self.session().await?.read_attribute(element, name).await
    }

    async fn read_text(&self, element: &ElementHandle) -> Result<String, DriverError> {
        self.session().await?.read_text(element).await
    }

    async fn click(&self, element: &ElementHandle) -> Result<(), DriverError> {
        self.session().await?.click(element).await
    }

    async fn send_keys(&self, element: &ElementHandle, text: &str) -> Result<(), DriverError> {
        self.session().await?.send_keys(element, text).await
    }

    async fn invoke_script(&self, script: &str, args: Vec<Value>) -> Result<Value, DriverError> {
        self.session().await?.invoke_script(script, args).await
    }

    async fn current_location(&self) -> Result<String, DriverError> {
        self.session().await?.current_location().await
    }

    async fn page_snapshot(&self) -> Result<String, DriverError> {
        self.session().await?.page_snapshot().await
    }
}
