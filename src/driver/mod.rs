//! Page-automation capability consumed by the executor, pipeline, poller and
//! bridge. The panel never drives a browser itself; it talks to whatever sits
//! behind [`PageDriver`].

pub mod lazy;
pub mod webdriver;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::models::Locator;

pub use lazy::LazySession;
pub use webdriver::{BrowserLaunch, WebDriverSession};

/// W3C key used to pass element references into scripts.
pub const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementHandle(String);

impl ElementHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }

    pub fn script_arg(&self) -> Value {
        json!({ ELEMENT_KEY: self.0 })
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DriverError {
    #[error("no element matches {0}")]
    NotFound(String),
    #[error("element reference is stale")]
    Stale,
    #[error("element is not interactable: {0}")]
    NotInteractable(String),
    #[error("driver call timed out")]
    Timeout,
    #[error("script failed: {0}")]
    Script(String),
    #[error("driver transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), DriverError>;

    async fn locate(&self, locator: &Locator) -> Result<ElementHandle, DriverError>;

    async fn locate_all(&self, locator: &Locator) -> Result<Vec<ElementHandle>, DriverError>;

    async fn read_attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, DriverError>;

    async fn read_text(&self, element: &ElementHandle) -> Result<String, DriverError>;

    async fn click(&self, element: &ElementHandle) -> Result<(), DriverError>;

    async fn send_keys(&self, element: &ElementHandle, text: &str) -> Result<(), DriverError>;

    async fn invoke_script(&self, script: &str, args: Vec<Value>) -> Result<Value, DriverError>;

    async fn current_location(&self) -> Result<String, DriverError>;

    /// Serialized DOM of the current page.
    async fn page_snapshot(&self) -> Result<String, DriverError>;
}
