use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{DriverError, ElementHandle, PageDriver, ELEMENT_KEY};
use crate::models::Locator;

const HTTP_TIMEOUT_SECS: u64 = 30;

/// Browser options used when the panel has to open its own session.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BrowserLaunch {
    pub headless: bool,
    pub user_data_dir: Option<String>,
    pub extra_args: Vec<String>,
}

impl BrowserLaunch {
    fn capabilities(&self) -> Value {
        let mut args = vec![
            "--no-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--disable-blink-features=AutomationControlled".to_string(),
        ];
        if self.headless {
            args.push("--headless=new".to_string());
        }
        if let Some(dir) = &self.user_data_dir {
            args.push(format!("--user-data-dir={dir}"));
            args.push("--profile-directory=Default".to_string());
        }
        args.extend(self.extra_args.iter().cloned());

        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "goog:chromeOptions": {
                        "args": args,
                        "excludeSwitches": ["enable-automation"],
                    }
                }
            }
        })
    }
}

/// Thin W3C WebDriver client bound to one browser session.
pub struct WebDriverSession {
    http: Client,
    endpoint: String,
    session_id: String,
}

#[derive(Deserialize)]
struct WireResponse {
    value: Value,
}

impl WebDriverSession {
    fn http_client() -> Result<Client, DriverError> {
        Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .no_proxy()
            .build()
            .map_err(|err| DriverError::Transport(err.to_string()))
    }

    /// Joins a session that something else (the operator's browser) already owns.
    pub async fn attach(endpoint: &str, session_id: &str) -> Result<Self, DriverError> {
        let session = Self {
            http: Self::http_client()?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            session_id: session_id.to_string(),
        };
        let url = session.current_location().await?;
        info!("Attached to WebDriver session {} at {}", session_id, url);
        Ok(session)
    }

    pub async fn create(endpoint: &str, launch: &BrowserLaunch) -> Result<Self, DriverError> {
        let http = Self::http_client()?;
        let endpoint = endpoint.trim_end_matches('/').to_string();
        let body = send(&http, Method::POST, &format!("{endpoint}/session"), Some(launch.capabilities())).await?;

        let session_id = body
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| DriverError::Transport("new session response has no sessionId".into()))?
            .to_string();
        info!("Created WebDriver session {}", session_id);

        let session = Self {
            http,
            endpoint,
            session_id,
        };
        // Hide the automation flag from page scripts, as the operator's browser does.
        if let Err(err) = session
            .invoke_script(
                "Object.defineProperty(navigator, 'webdriver', {get: () => undefined})",
                Vec::new(),
            )
            .await
        {
            warn!("Failed to mask navigator.webdriver: {}", err);
        }
        Ok(session)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn quit(&self) -> Result<(), DriverError> {
        self.command(Method::DELETE, "", None).await.map(|_| ())
    }

    async fn command(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, DriverError> {
        let url = format!("{}/session/{}{}", self.endpoint, self.session_id, path);
        send(&self.http, method, &url, body).await
    }
}

async fn send(http: &Client, method: Method, url: &str, body: Option<Value>) -> Result<Value, DriverError> {
    debug!("webdriver {} {}", method, url);
    let mut request = http.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request
        .send()
        .await
        .map_err(|err| DriverError::Transport(err.to_string()))?;
    let status = response.status();
    let wire: WireResponse = response
        .json()
        .await
        .map_err(|err| DriverError::Transport(format!("invalid response ({status}): {err}")))?;

    match wire.value.get("error").and_then(Value::as_str) {
        Some(code) => {
            let message = wire
                .value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Err(classify_error(code, message))
        }
        None if !status.is_success() => Err(DriverError::Transport(format!("HTTP {status}"))),
        None => Ok(wire.value),
    }
}

fn classify_error(code: &str, message: &str) -> DriverError {
    match code {
        "no such element" => DriverError::NotFound(message.to_string()),
        "stale element reference" => DriverError::Stale,
        "element not interactable" | "element click intercepted" | "invalid element state" => {
            DriverError::NotInteractable(message.to_string())
        }
        "javascript error" => DriverError::Script(message.to_string()),
        other => DriverError::Transport(format!("{other}: {message}")),
    }
}

fn element_from_value(value: &Value) -> Option<ElementHandle> {
    value
        .get(ELEMENT_KEY)
        .or_else(|| value.get("ELEMENT"))
        .and_then(Value::as_str)
        .map(ElementHandle::new)
}

#[async_trait]
impl PageDriver for WebDriverSession {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.command(Method::POST, "/url", Some(json!({ "url": url })))
            .await
            .map(|_| ())
    }

    async fn locate(&self, locator: &Locator) -> Result<ElementHandle, DriverError> {
        let body = json!({ "using": locator.strategy(), "value": locator.value() });
        let value = self.command(Method::POST, "/element", Some(body)).await?;
        element_from_value(&value).ok_or_else(|| DriverError::NotFound(locator.to_string()))
    }

    async fn locate_all(&self, locator: &Locator) -> Result<Vec<ElementHandle>, DriverError> {
        let body = json!({ "using": locator.strategy(), "value": locator.value() });
        let value = self.command(Method::POST, "/elements", Some(body)).await?;
        Ok(value
            .as_array()
            .map(|items| items.iter().filter_map(element_from_value).collect())
            .unwrap_or_default())
    }

    async fn read_attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, DriverError> {
        let path = format!("/element/{}/attribute/{}", element.id(), name);
        let value = self.command(Method::GET, &path, None).await?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn read_text(&self, element: &ElementHandle) -> Result<String, DriverError> {
        let path = format!("/element/{}/text", element.id());
        let value = self.command(Method::GET, &path, None).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn click(&self, element: &ElementHandle) -> Result<(), DriverError> {
        let path = format!("/element/{}/click", element.id());
        self.command(Method::POST, &path, Some(json!({}))).await.map(|_| ())
    }

    async fn send_keys(&self, element: &ElementHandle, text: &str) -> Result<(), DriverError> {
        let path = format!("/element/{}/value", element.id());
        self.command(Method::POST, &path, Some(json!({ "text": text })))
            .await
            .map(|_| ())
    }

    async fn invoke_script(&self, script: &str, args: Vec<Value>) -> Result<Value, DriverError> {
        let body = json!({ "script": script, "args": args });
        self.command(Method::POST, "/execute/sync", Some(body)).await
    }

    async fn current_location(&self) -> Result<String, DriverError> {
        let value = self.command(Method::GET, "/url", None).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn page_snapshot(&self) -> Result<String, DriverError> {
        let value = self.command(Method::GET, "/source", None).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }
}
