//! In-memory stand-ins for the browser, the network and the window.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::bridge::{AutomationBridge, SecondarySession, SessionFactory};
use crate::context::{PageControls, SessionContext};
use crate::driver::{DriverError, ElementHandle, PageDriver, ELEMENT_KEY};
use crate::executor::ActionExecutor;
use crate::executor::strategy::{CLICK_SCRIPT, POINTER_SCRIPT, READ_ATTRIBUTE_SCRIPT, READ_TEXT_SCRIPT};
use crate::models::{Locator, LocatorSet};
use crate::pipeline::{ExtractionPipeline, ExtractionSelectors};
use crate::status::{InstructionBuffer, PanelEvent, StatusSink, StatusUpdate};
use crate::storage::{ArtifactFetcher, FetchedArtifact, TaskStore};

#[derive(Debug, Clone, Default)]
pub struct FakeElement {
    /// The front value is returned; native reads pop it while more remain.
    pub attributes: HashMap<String, VecDeque<String>>,
    pub text: String,
    /// What page script sees when it differs from the native text.
    pub script_text: Option<String>,
    /// `None` means the native click succeeds.
    pub native_click: Option<DriverError>,
    pub script_click: bool,
    pub pointer_click: bool,
    /// Number of handles handed out stale; `usize::MAX` means every one.
    pub stale_uses: usize,
    pub click_delay: Option<Duration>,
}

impl FakeElement {
    pub fn clickable() -> Self {
        Self {
            script_click: true,
            pointer_click: true,
            ..Self::default()
        }
    }

    pub fn unclickable() -> Self {
        Self {
            native_click: Some(DriverError::NotInteractable("element is disabled".into())),
            ..Self::default()
        }
    }

    pub fn with_text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            ..Self::default()
        }
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes
            .insert(name.to_string(), VecDeque::from([value.to_string()]));
        self
    }
}

struct HandleEntry {
    locator: Locator,
    index: usize,
    stale: bool,
}

#[derive(Default)]
struct FakePage {
    elements: HashMap<Locator, Vec<FakeElement>>,
    reveals: HashMap<Locator, Vec<(Locator, FakeElement)>>,
    handles: HashMap<String, HandleEntry>,
    next_handle: usize,
    location: String,
    location_failures: usize,
    snapshot: String,
    snapshot_requests: usize,
    clicks: Vec<String>,
    typed: Vec<String>,
    navigations: Vec<String>,
}

impl FakePage {
    fn issue(&mut self, locator: &Locator, index: usize, stale: bool) -> ElementHandle {
        self.next_handle += 1;
        let id = format!("h{}", self.next_handle);
        self.handles.insert(
            id.clone(),
            HandleEntry {
                locator: locator.clone(),
                index,
                stale,
            },
        );
        ElementHandle::new(id)
    }

    fn resolve(&mut self, id: &str) -> Result<(Locator, &mut FakeElement), DriverError> {
        let entry = self.handles.get(id).ok_or(DriverError::Stale)?;
        if entry.stale {
            return Err(DriverError::Stale);
        }
        let (locator, index) = (entry.locator.clone(), entry.index);
        let element = self
            .elements
            .get_mut(&locator)
            .and_then(|found| found.get_mut(index))
            .ok_or(DriverError::Stale)?;
        Ok((locator, element))
    }

    fn clicked(&mut self, how: &str, locator: &Locator) {
        self.clicks.push(format!("{how}:{locator}"));
        if let Some(revealed) = self.reveals.remove(locator) {
            for (target, element) in revealed {
                self.elements.entry(target).or_default().push(element);
            }
        }
    }
}

/// Scripted [`PageDriver`]. Handles go stale when their element is replaced.
pub struct FakeDriver {
    page: Mutex<FakePage>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            page: Mutex::new(FakePage {
                location: "https://annotate.test/workbench/?pack_key=1".to_string(),
                snapshot: "<html><body></body></html>".to_string(),
                ..FakePage::default()
            }),
        }
    }

    fn page(&self) -> MutexGuard<'_, FakePage> {
        self.page.lock().unwrap()
    }

    /// Replaces whatever `locator` matched before.
    pub fn add_element(&self, locator: &Locator, element: FakeElement) {
        let mut page = self.page();
        page.elements.insert(locator.clone(), vec![element]);
        page.handles.retain(|_, entry| &entry.locator != locator);
    }

    pub fn remove_element(&self, locator: &Locator) {
        let mut page = self.page();
        page.elements.remove(locator);
        page.handles.retain(|_, entry| &entry.locator != locator);
    }

    /// Successive native reads of `name` return `values` in order; the last
    /// one sticks.
    pub fn queue_attribute(&self, locator: &Locator, name: &str, values: &[&str]) {
        let mut page = self.page();
        if let Some(element) = page.elements.get_mut(locator).and_then(|found| found.first_mut()) {
            element.attributes.insert(
                name.to_string(),
                values.iter().map(|value| value.to_string()).collect(),
            );
        }
    }

    /// Makes `element` appear under `target` once `trigger` is clicked.
    pub fn reveal_on_click(&self, trigger: &Locator, target: &Locator, element: FakeElement) {
        self.page()
            .reveals
            .entry(trigger.clone())
            .or_default()
            .push((target.clone(), element));
    }

    /// Moves the page without going through [`PageDriver::navigate`].
    pub fn set_location(&self, url: &str) {
        self.page().location = url.to_string();
    }

    pub fn fail_location(&self, times: usize) {
        self.page().location_failures = times;
    }

    pub fn clicks(&self) -> Vec<String> {
        self.page().clicks.clone()
    }

    pub fn typed(&self) -> Vec<String> {
        self.page().typed.clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.page().navigations.clone()
    }

    pub fn snapshot_requests(&self) -> usize {
        self.page().snapshot_requests
    }
}

fn element_id(args: &[Value]) -> Result<String, DriverError> {
    args.first()
        .and_then(|arg| arg.get(ELEMENT_KEY))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| DriverError::Script("missing element argument".into()))
}

#[async_trait]
impl PageDriver for FakeDriver {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        let mut page = self.page();
        page.navigations.push(url.to_string());
        page.location = url.to_string();
        Ok(())
    }

    async fn locate(&self, locator: &Locator) -> Result<ElementHandle, DriverError> {
        let mut page = self.page();
        let element = page
            .elements
            .get_mut(locator)
            .and_then(|found| found.first_mut())
            .ok_or_else(|| DriverError::NotFound(locator.to_string()))?;
        let stale = element.stale_uses > 0;
        if stale && element.stale_uses != usize::MAX {
            element.stale_uses -= 1;
        }
        Ok(page.issue(locator, 0, stale))
    }

    async fn locate_all(&self, locator: &Locator) -> Result<Vec<ElementHandle>, DriverError> {
        let mut page = self.page();
        let count = page.elements.get(locator).map_or(0, Vec::len);
        Ok((0..count).map(|index| page.issue(locator, index, false)).collect())
    }

    async fn read_attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, DriverError> {
        let mut page = self.page();
        let (_, element) = page.resolve(element.id())?;
        let Some(values) = element.attributes.get_mut(name) else {
            return Ok(None);
        };
        let value = values.front().cloned();
        if values.len() > 1 {
            values.pop_front();
        }
        Ok(value)
    }

    async fn read_text(&self, element: &ElementHandle) -> Result<String, DriverError> {
        let mut page = self.page();
        let (_, element) = page.resolve(element.id())?;
        Ok(element.text.clone())
    }

    async fn click(&self, element: &ElementHandle) -> Result<(), DriverError> {
        let delay = {
            let mut page = self.page();
            let (_, found) = page.resolve(element.id())?;
            found.click_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut page = self.page();
        let (locator, found) = page.resolve(element.id())?;
        if let Some(err) = &found.native_click {
            return Err(err.clone());
        }
        page.clicked("native", &locator);
        Ok(())
    }

    async fn send_keys(&self, element: &ElementHandle, text: &str) -> Result<(), DriverError> {
        let mut page = self.page();
        page.resolve(element.id())?;
        page.typed.push(text.to_string());
        Ok(())
    }

    async fn invoke_script(&self, script: &str, args: Vec<Value>) -> Result<Value, DriverError> {
        let mut page = self.page();
        let id = match script {
            CLICK_SCRIPT | POINTER_SCRIPT | READ_ATTRIBUTE_SCRIPT | READ_TEXT_SCRIPT => element_id(&args)?,
            _ => return Ok(Value::Null),
        };
        let (locator, element) = page.resolve(&id)?;

        match script {
            CLICK_SCRIPT | POINTER_SCRIPT => {
                let (how, allowed) = if script == CLICK_SCRIPT {
                    ("script", element.script_click)
                } else {
                    ("pointer", element.pointer_click)
                };
                if allowed {
                    page.clicked(how, &locator);
                }
                Ok(Value::Bool(allowed))
            }
            READ_ATTRIBUTE_SCRIPT => {
                let name = args.get(1).and_then(Value::as_str).unwrap_or_default();
                Ok(element
                    .attributes
                    .get(name)
                    .and_then(|values| values.front().cloned())
                    .map_or(Value::Null, Value::String))
            }
            _ => Ok(Value::String(
                element.script_text.clone().unwrap_or_else(|| element.text.clone()),
            )),
        }
    }

    async fn current_location(&self) -> Result<String, DriverError> {
        let mut page = self.page();
        if page.location_failures > 0 {
            page.location_failures -= 1;
            return Err(DriverError::Transport("connection reset".into()));
        }
        Ok(page.location.clone())
    }

    async fn page_snapshot(&self) -> Result<String, DriverError> {
        let mut page = self.page();
        page.snapshot_requests += 1;
        Ok(page.snapshot.clone())
    }
}

/// Serves the same bytes for every reference.
pub struct StaticFetcher {
    bytes: Vec<u8>,
    failing: AtomicBool,
}

impl StaticFetcher {
    pub fn new(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl ArtifactFetcher for StaticFetcher {
    async fn fetch(&self, reference: &str) -> Result<FetchedArtifact> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("GET {reference} failed: connection refused");
        }
        Ok(FetchedArtifact {
            bytes: self.bytes.clone(),
            content_type: None,
        })
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<PanelEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<PanelEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<StatusUpdate> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                PanelEvent::Status(update) => Some(update),
                _ => None,
            })
            .collect()
    }

    pub fn instructions(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                PanelEvent::Instruction(text) => Some(text),
                _ => None,
            })
            .collect()
    }
}

impl StatusSink for RecordingSink {
    fn publish(&self, event: PanelEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Hands out [`FakeSession`]s and counts what happens to them.
#[derive(Default)]
pub struct FakeSessionFactory {
    pub opened: AtomicUsize,
    pub closed: Arc<AtomicUsize>,
    pub submissions: Arc<AtomicUsize>,
    pub refuse: AtomicBool,
    pub fail_submit: Arc<AtomicBool>,
}

#[async_trait]
impl SessionFactory for FakeSessionFactory {
    async fn open(&self) -> Result<Arc<dyn SecondarySession>> {
        if self.refuse.load(Ordering::SeqCst) {
            bail!("chromedriver is not running");
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeSession {
            driver: FakeDriver::new(),
            closed: self.closed.clone(),
            submissions: self.submissions.clone(),
            fail_submit: self.fail_submit.clone(),
        }))
    }
}

pub struct FakeSession {
    driver: FakeDriver,
    closed: Arc<AtomicUsize>,
    submissions: Arc<AtomicUsize>,
    fail_submit: Arc<AtomicBool>,
}

#[async_trait]
impl PageDriver for FakeSession {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        self.driver.navigate(url).await
    }

    async fn locate(&self, locator: &Locator) -> Result<ElementHandle, DriverError> {
        self.driver.locate(locator).await
    }

    async fn locate_all(&self, locator: &Locator) -> Result<Vec<ElementHandle>, DriverError> {
        self.driver.locate_all(locator).await
    }

    async fn read_attribute(
        &self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, DriverError> {
        self.driver.read_attribute(element, name).await
    }

    async fn read_text(&self, element: &ElementHandle) -> Result<String, DriverError> {
        self.driver.read_text(element).await
    }

    async fn click(&self, element: &ElementHandle) -> Result<(), DriverError> {
        self.driver.click(element).await
    }

    async fn send_keys(&self, element: &ElementHandle, text: &str) -> Result<(), DriverError> {
        self.driver.send_keys(element, text).await
    }

    async fn invoke_script(&self, script: &str, args: Vec<Value>) -> Result<Value, DriverError> {
        self.driver.invoke_script(script, args).await
    }

    async fn current_location(&self) -> Result<String, DriverError> {
        self.driver.current_location().await
    }

    async fn page_snapshot(&self) -> Result<String, DriverError> {
        self.driver.page_snapshot().await
    }
}

#[async_trait]
impl SecondarySession for FakeSession {
    async fn submit(&self, _artifact: &Path, _instruction: &str, results_dir: &Path) -> Result<PathBuf> {
        let n = self.submissions.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_submit.load(Ordering::SeqCst) {
            bail!("no generated image within 1s");
        }
        Ok(results_dir.join(format!("generated_{n}.png")))
    }

    async fn close(&self) -> Result<(), DriverError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn task_image() -> Locator {
    Locator::css("img.task-image")
}

/// Puts one annotation task on the fake page.
pub fn show_task(driver: &FakeDriver, src: &str, instruction: &str) {
    driver.add_element(&task_image(), FakeElement::default().with_attribute("src", src));
    driver.add_element(&Locator::css(".instruction"), FakeElement::with_text(instruction));
    driver.add_element(&Locator::css(".size"), FakeElement::with_text("尺寸: 1024 × 768"));
}

pub fn extraction_selectors() -> ExtractionSelectors {
    ExtractionSelectors {
        image: LocatorSet::new(task_image(), vec![]),
        instruction: LocatorSet::new(Locator::css(".instruction"), vec![]),
        size: Some(LocatorSet::new(Locator::css(".size"), vec![])),
    }
}

/// A full context over fakes, persisting under `root`.
pub fn session_context(root: &Path, driver: Arc<FakeDriver>, sink: Arc<RecordingSink>) -> Arc<SessionContext> {
    let executor = Arc::new(ActionExecutor::new(driver, Duration::from_millis(200)));
    let pipeline = ExtractionPipeline::open(
        executor.clone(),
        Arc::new(StaticFetcher::new(b"img")),
        TaskStore::new(root.to_path_buf()),
        extraction_selectors(),
        false,
        sink.clone(),
    )
    .unwrap();

    Arc::new(SessionContext {
        executor,
        pipeline: Arc::new(pipeline),
        bridge: Arc::new(AutomationBridge::new(Arc::new(FakeSessionFactory::default()))),
        instructions: Arc::new(InstructionBuffer::new(sink.clone())),
        sink,
        controls: PageControls {
            select: LocatorSet::new(Locator::css("button.select"), vec![]),
            skip: LocatorSet::new(Locator::css("button.skip"), vec![]),
            submit: LocatorSet::new(Locator::css("button.submit"), vec![]),
        },
    })
}

/// Minimal chromedriver over real HTTP. Knows one session, `s1`.
pub struct WebDriverStub {
    addr: std::net::SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    server: JoinHandle<()>,
}

#[derive(Clone, Copy)]
struct StubBehavior {
    session_delay: Duration,
    fail_navigation: bool,
}

impl WebDriverStub {
    pub const LOCATION: &'static str = "https://annotate.test/workbench/";

    /// `session_delay` holds back the new-session reply; `fail_navigation`
    /// makes every navigation answer with a W3C error.
    pub async fn start(session_delay: Duration, fail_navigation: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let behavior = StubBehavior {
            session_delay,
            fail_navigation,
        };

        let log = requests.clone();
        let server = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_stub(stream, log.clone(), behavior));
            }
        });

        Self { addr, requests, server }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// How many requests matched `"METHOD /path"` exactly.
    pub fn count(&self, request: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|seen| seen.as_str() == request)
            .count()
    }
}

impl Drop for WebDriverStub {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn serve_stub(mut stream: TcpStream, log: Arc<Mutex<Vec<String>>>, behavior: StubBehavior) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = buf.windows(4).position(|window| window == b"\r\n\r\n") {
            break pos + 4;
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }

    let mut parts = head.lines().next().unwrap_or_default().split_whitespace();
    let request = format!("{} {}", parts.next().unwrap_or_default(), parts.next().unwrap_or_default());
    log.lock().unwrap().push(request.clone());

    let (status, value) = match request.as_str() {
        "POST /session" => {
            tokio::time::sleep(behavior.session_delay).await;
            ("200 OK", json!({ "sessionId": "s1", "capabilities": {} }))
        }
        "POST /session/s1/url" if behavior.fail_navigation => (
            "500 Internal Server Error",
            json!({ "error": "unknown error", "message": "net::ERR_NAME_NOT_RESOLVED" }),
        ),
        "GET /session/s1/url" => ("200 OK", json!(WebDriverStub::LOCATION)),
        "POST /session/s1/url" | "POST /session/s1/execute/sync" | "DELETE /session/s1" => {
            ("200 OK", Value::Null)
        }
        _ => (
            "404 Not Found",
            json!({ "error": "unknown command", "message": request.clone() }),
        ),
    };

    let body = json!({ "value": value }).to_string();
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}
