use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

use super::{SecondarySession, SessionFactory};
use crate::driver::{BrowserLaunch, DriverError, ElementHandle, PageDriver, WebDriverSession};
use crate::executor::ActionExecutor;
use crate::models::{Locator, LocatorSet};
use crate::storage::ArtifactFetcher;

const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AssistantSettings {
    pub url: String,
    /// Defaults to the main WebDriver endpoint.
    pub webdriver_url: Option<String>,
    pub browser: BrowserLaunch,
    pub file_input: LocatorSet,
    pub prompt_input: LocatorSet,
    pub send_button: LocatorSet,
    pub loading_indicator: Locator,
    pub generated_image: Locator,
    pub response_timeout_secs: u64,
    pub response_poll_ms: u64,
}

impl Default for AssistantSettings {
    fn default() -> Self {
        Self {
            url: "https://yuanbao.tencent.com/chat".to_string(),
            webdriver_url: None,
            browser: BrowserLaunch::default(),
            file_input: LocatorSet::new(Locator::xpath("//input[@type='file']"), vec![]),
            prompt_input: LocatorSet::new(
                Locator::xpath("//textarea[@placeholder='请输入您的问题']"),
                vec![Locator::css("textarea"), Locator::css("[contenteditable='true']")],
            ),
            send_button: LocatorSet::new(
                Locator::xpath("//button[contains(@class, 'send-btn')]"),
                vec![Locator::xpath("//button[contains(., '发送')]")],
            ),
            loading_indicator: Locator::xpath("//div[contains(@class, 'loading')]"),
            generated_image: Locator::xpath(
                "//img[contains(@class, 'generated-image') or contains(@src, 'data:image')]",
            ),
            response_timeout_secs: 60,
            response_poll_ms: 1000,
        }
    }
}

/// The assistant round trip, written against any [`PageDriver`].
pub struct AssistantFlow {
    driver: Arc<dyn PageDriver>,
    executor: ActionExecutor,
    fetcher: Arc<dyn ArtifactFetcher>,
    settings: AssistantSettings,
}

impl AssistantFlow {
    pub fn new(
        driver: Arc<dyn PageDriver>,
        fetcher: Arc<dyn ArtifactFetcher>,
        settings: AssistantSettings,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            executor: ActionExecutor::new(driver.clone(), attempt_timeout),
            driver,
            fetcher,
            settings,
        }
    }

    pub async fn run(&self, artifact: &Path, instruction: &str, results_dir: &Path) -> Result<PathBuf> {
        let artifact = artifact
            .canonicalize()
            .with_context(|| format!("artifact {} is not readable", artifact.display()))?;
        self.ensure_on_assistant().await?;

        // Images already on the page belong to earlier turns.
        let baseline = self
            .driver
            .locate_all(&self.settings.generated_image)
            .await
            .map(|found| found.len())
            .unwrap_or(0);

        let upload = self.locate_any(&self.settings.file_input).await.context("no file input")?;
        self.driver
            .send_keys(&upload, &artifact.to_string_lossy())
            .await
            .context("uploading artifact failed")?;

        let prompt = self
            .locate_any(&self.settings.prompt_input)
            .await
            .context("no prompt input")?;
        self.driver
            .send_keys(&prompt, instruction)
            .await
            .context("typing instruction failed")?;

        self.executor
            .execute(&self.settings.send_button.click())
            .await
            .map_err(|failure| anyhow!("send button: {failure}"))?;
        log_info!("Sent {} to assistant, waiting for a reply", artifact.display());

        let images = self.wait_for_images(baseline).await?;
        self.save_images(&images, results_dir).await
    }

    async fn ensure_on_assistant(&self) -> Result<()> {
        let location = self.driver.current_location().await.unwrap_or_default();
        if !location.starts_with(&self.settings.url) {
            self.driver
                .navigate(&self.settings.url)
                .await
                .with_context(|| format!("could not open {}", self.settings.url))?;
        }
        Ok(())
    }

    async fn locate_any(&self, set: &LocatorSet) -> Result<ElementHandle, DriverError> {
        let mut last = DriverError::NotFound(set.primary.to_string());
        for locator in std::iter::once(&set.primary).chain(set.fallbacks.iter()) {
            match self.driver.locate(locator).await {
                Ok(handle) => return Ok(handle),
                Err(err) => last = err,
            }
        }
        Err(last)
    }

    async fn wait_for_images(&self, baseline: usize) -> Result<Vec<ElementHandle>> {
        let deadline = Instant::now() + Duration::from_secs(self.settings.response_timeout_secs);
        let poll = Duration::from_millis(self.settings.response_poll_ms.max(50));

        loop {
            let loading = self
                .driver
                .locate_all(&self.settings.loading_indicator)
                .await
                .map(|found| !found.is_empty())
                .unwrap_or(false);
            if !loading {
                let mut images = self.driver.locate_all(&self.settings.generated_image).await?;
                if images.len() > baseline {
                    return Ok(images.split_off(baseline));
                }
            }
            if Instant::now() >= deadline {
                bail!(
                    "no generated image within {}s",
                    self.settings.response_timeout_secs
                );
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn save_images(&self, images: &[ElementHandle], results_dir: &Path) -> Result<PathBuf> {
        tokio::fs::create_dir_all(results_dir)
            .await
            .with_context(|| format!("failed to create {}", results_dir.display()))?;

        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let mut saved = Vec::new();
        for (i, image) in images.iter().enumerate() {
            let Some(src) = self.driver.read_attribute(image, "src").await? else {
                continue;
            };
            let artifact = match self.fetcher.fetch(&src).await {
                Ok(artifact) => artifact,
                Err(err) => {
                    log_warn!("Skipping generated image {}: {:#}", i + 1, err);
                    continue;
                }
            };
            let path = results_dir.join(format!("generated_{stamp}_{}.png", i + 1));
            tokio::fs::write(&path, &artifact.bytes)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            saved.push(path);
        }

        log_info!("Saved {} generated image(s) to {}", saved.len(), results_dir.display());
        saved
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no generated image could be saved"))
    }
}

/// Assistant running in its own WebDriver-controlled browser.
pub struct AssistantSession {
    webdriver: Arc<WebDriverSession>,
    flow: AssistantFlow,
}

#[async_trait]
impl PageDriver for AssistantSession {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.webdriver.navigate(url).await
    }

    async fn locate(&self, locator: &Locator) -> Result<ElementHandle, DriverError> {
        self.webdriver.locate(locator).await
    }

    async fn locate_all(&self, locator: &Locator) -> Result<Vec<ElementHandle>, DriverError> {
        self.webdriver.locate_all(locator).await
    }

    async fn read_attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, DriverError> {
        self.webdriver.read_attribute(element, name).await
    }

    async fn read_text(&self, element: &ElementHandle) -> Result<String, DriverError> {
        self.webdriver.read_text(element).await
    }

    async fn click(&self, element: &ElementHandle) -> Result<(), DriverError> {
        self.webdriver.click(element).await
    }

    async fn send_keys(&self, element: &ElementHandle, text: &str) -> Result<(), DriverError> {
        self.webdriver.send_keys(element, text).await
    }

    async fn invoke_script(&self, script: &str, args: Vec<Value>) -> Result<Value, DriverError> {
        self.webdriver.invoke_script(script, args).await
    }

    async fn current_location(&self) -> Result<String, DriverError> {
        self.webdriver.current_location().await
    }

    async fn page_snapshot(&self) -> Result<String, DriverError> {
        self.webdriver.page_snapshot().await
    }
}

#[async_trait]
impl SecondarySession for AssistantSession {
    async fn submit(&self, artifact: &Path, instruction: &str, results_dir: &Path) -> Result<PathBuf> {
        self.flow.run(artifact, instruction, results_dir).await
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.webdriver.quit().await
    }
}

pub struct AssistantFactory {
    endpoint: String,
    settings: AssistantSettings,
    fetcher: Arc<dyn ArtifactFetcher>,
    attempt_timeout: Duration,
}

impl AssistantFactory {
    pub fn new(
        endpoint: String,
        settings: AssistantSettings,
        fetcher: Arc<dyn ArtifactFetcher>,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            settings,
            fetcher,
            attempt_timeout,
        }
    }
}

#[async_trait]
impl SessionFactory for AssistantFactory {
    async fn open(&self) -> Result<Arc<dyn SecondarySession>> {
        let endpoint = self.settings.webdriver_url.as_deref().unwrap_or(&self.endpoint);
        if let Some(dir) = &self.settings.browser.user_data_dir {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create assistant profile {dir}"))?;
        }

        let webdriver = Arc::new(
            WebDriverSession::create(endpoint, &self.settings.browser)
                .await
                .with_context(|| format!("could not start assistant browser via {endpoint}"))?,
        );
        if let Err(err) = webdriver.navigate(&self.settings.url).await {
            // The browser was started for this session alone; nobody else will close it.
            if let Err(quit_err) = webdriver.quit().await {
                log_warn!(
                    "Failed to close assistant session {}: {}",
                    webdriver.session_id(),
                    quit_err
                );
            }
            return Err(err).with_context(|| format!("could not open {}", self.settings.url));
        }
        log_info!(
            "Assistant session {} ready at {}",
            webdriver.session_id(),
            self.settings.url
        );

        let flow = AssistantFlow::new(
            webdriver.clone(),
            self.fetcher.clone(),
            self.settings.clone(),
            self.attempt_timeout,
        );
        Ok(Arc::new(AssistantSession { webdriver, flow }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeDriver, FakeElement, StaticFetcher, WebDriverStub};
    use tempfile::TempDir;

    fn settings() -> AssistantSettings {
        AssistantSettings {
            url: "https://assistant.test/chat".into(),
            response_timeout_secs: 1,
            response_poll_ms: 50,
            ..AssistantSettings::default()
        }
    }

    fn flow(driver: &Arc<FakeDriver>) -> AssistantFlow {
        AssistantFlow::new(
            driver.clone(),
            Arc::new(StaticFetcher::new(b"generated")),
            settings(),
            Duration::from_millis(200),
        )
    }

    fn assistant_page(driver: &FakeDriver) {
        let settings = settings();
        driver.add_element(&settings.file_input.primary, FakeElement::default());
        driver.add_element(&settings.prompt_input.primary, FakeElement::default());
        driver.add_element(&settings.send_button.primary, FakeElement::clickable());
    }

    #[tokio::test]
    async fn round_trip_saves_new_images() {
        let tmp = TempDir::new().unwrap();
        let slot = tmp.path().join("tasks/2024-06-15/1");
        std::fs::create_dir_all(&slot).unwrap();
        let artifact = slot.join("image.jpg");
        std::fs::write(&artifact, b"jpeg").unwrap();

        let driver = Arc::new(FakeDriver::new());
        assistant_page(&driver);
        let settings = settings();
        driver.add_element(
            &settings.generated_image,
            FakeElement::default().with_attribute("src", "data:image/png;base64,b2xk"),
        );
        driver.reveal_on_click(
            &settings.send_button.primary,
            &settings.generated_image,
            FakeElement::default().with_attribute("src", "https://cdn.test/out.png"),
        );

        let produced = flow(&driver)
            .run(&artifact, "remove background", &slot.join("results"))
            .await
            .unwrap();

        assert!(produced.starts_with(slot.join("results")));
        let name = produced.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("generated_") && name.ends_with("_1.png"));
        assert_eq!(std::fs::read(&produced).unwrap(), b"generated");
        assert_eq!(driver.navigations(), vec!["https://assistant.test/chat".to_string()]);

        let typed = driver.typed();
        assert_eq!(typed.len(), 2);
        assert_eq!(typed[0], artifact.canonicalize().unwrap().to_string_lossy());
        assert_eq!(typed[1], "remove background");
    }

    #[tokio::test]
    async fn times_out_without_reply() {
        let tmp = TempDir::new().unwrap();
        let artifact = tmp.path().join("image.jpg");
        std::fs::write(&artifact, b"jpeg").unwrap();

        let driver = Arc::new(FakeDriver::new());
        driver.set_location("https://assistant.test/chat?id=7");
        assistant_page(&driver);

        let err = flow(&driver)
            .run(&artifact, "crop", &tmp.path().join("results"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no generated image"));
        assert!(driver.navigations().is_empty());
    }

    fn factory(stub: &WebDriverStub) -> AssistantFactory {
        AssistantFactory::new(
            stub.endpoint(),
            settings(),
            Arc::new(StaticFetcher::new(b"generated")),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn open_closes_browser_when_assistant_page_fails() {
        let stub = WebDriverStub::start(Duration::ZERO, true).await;

        let err = factory(&stub).open().await.err().unwrap();

        assert!(err.to_string().contains("could not open https://assistant.test/chat"));
        assert_eq!(stub.count("POST /session"), 1);
        assert_eq!(stub.count("POST /session/s1/url"), 1);
        assert_eq!(stub.count("DELETE /session/s1"), 1);
    }

    #[tokio::test]
    async fn open_keeps_browser_on_success() {
        let stub = WebDriverStub::start(Duration::ZERO, false).await;

        let session = factory(&stub).open().await;

        assert!(session.is_ok());
        assert_eq!(stub.count("DELETE /session/s1"), 0);
    }
}
