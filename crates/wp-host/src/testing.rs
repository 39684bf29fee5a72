//! In-memory simulated engine.
//!
//! Binds the engine seam to a simulation good enough to exercise the whole
//! system in-process: pages "load" by fetching the served entry through
//! the interception pipeline and then run a configured Rust page program
//! (the stand-in for the bundled test script), contexts route every fetch
//! through the universal matcher when one is attached, and remote objects
//! answer a small documented set of normalized sources.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use wp_client::{FetchRequest, FetchResponse, Harness, PageEnvironment};
use wp_runtime::expr::NormalizedFn;
use wp_runtime::message::HeaderEntry;
use wp_runtime::remote::{RemoteValue, ValueNode};

use crate::bridge::BRIDGE_PATH;
use crate::engine::{
    BrowserContext, BrowserEngine, BrowserKind, ContextOptions, ContinueOverrides, FulfillResponse,
    HostArg, HostValue, InterceptHandler, InterceptedRoute, Page, RemoteObject, RequestMeta,
};
use crate::error::{Error, Result};

/// A page program: the simulation's stand-in for the bundled entry.
pub type PageProgram = Arc<dyn Fn(PageWorld) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Wraps an async closure as a [`PageProgram`].
pub fn page_program<F, Fut>(program: F) -> PageProgram
where
    F: Fn(PageWorld) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |world| Box::pin(program(world)))
}

const SIM_VERSION: &str = "SimBrowser/1.0";

/// The simulated engine.
pub struct SimEngine {
    kind: BrowserKind,
    program: PageProgram,
}

impl SimEngine {
    pub fn new(program: PageProgram) -> Arc<Self> {
        Self::with_kind(BrowserKind::Chromium, program)
    }

    pub fn with_kind(kind: BrowserKind, program: PageProgram) -> Arc<Self> {
        Arc::new(Self { kind, program })
    }
}

#[async_trait]
impl BrowserEngine for SimEngine {
    fn kind(&self) -> BrowserKind {
        self.kind
    }

    fn version(&self) -> String {
        SIM_VERSION.to_owned()
    }

    async fn new_context(&self, options: ContextOptions) -> Result<Arc<dyn BrowserContext>> {
        Ok(SimContext::new(self.kind, options.base_url, Arc::clone(&self.program)))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A simulated browsing context.
pub struct SimContext {
    kind: BrowserKind,
    base_url: Option<String>,
    program: PageProgram,
    interception: Mutex<Option<InterceptHandler>>,
    http: reqwest::Client,
    self_ref: Weak<SimContext>,
}

impl SimContext {
    fn new(kind: BrowserKind, base_url: Option<String>, program: PageProgram) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            kind,
            base_url,
            program,
            interception: Mutex::new(None),
            http: reqwest::Client::new(),
            self_ref: self_ref.clone(),
        })
    }

    fn resolve_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_owned();
        }
        let base = self.base_url.clone().unwrap_or_default();
        format!("{}{}", base.trim_end_matches('/'), url)
    }

    /// Runs one request through the interception pipeline (or straight to
    /// the network when no matcher is attached).
    pub async fn dispatch_fetch(&self, request: RequestMeta) -> Result<FulfillResponse> {
        let handler = self.interception.lock().clone();
        match handler {
            Some(handler) => {
                let (route, decision) = SimRoute::new(request.clone());
                handler(route).await;
                let decision = decision
                    .await
                    .map_err(|_| Error::RequestFailed("route dropped without a decision".into()))?;
                match decision {
                    Decision::Fulfill(response) => Ok(response),
                    Decision::Continue(overrides) => {
                        self.network_fetch(apply_overrides(request, overrides)).await
                    }
                    Decision::Abort(code) => {
                        Err(Error::RequestFailed(format!("net::ERR_{}", code.to_uppercase())))
                    }
                }
            }
            None => self.network_fetch(request).await,
        }
    }

    async fn network_fetch(&self, request: RequestMeta) -> Result<FulfillResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|err| Error::RequestFailed(format!("bad method: {err}")))?;
        let mut builder = self.http.request(method, &request.url);
        for header in &request.headers {
            builder = builder.header(&header.name, &header.value);
        }
        if let Some(body) = request.post_data {
            builder = builder.body(body);
        }
        let response = builder
            .send()
            .await
            .map_err(|err| Error::RequestFailed(err.to_string()))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|value| HeaderEntry {
                    name: name.as_str().to_owned(),
                    value: value.to_owned(),
                })
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|err| Error::RequestFailed(err.to_string()))?
            .to_vec();
        Ok(FulfillResponse {
            status,
            headers,
            body,
        })
    }
}

fn apply_overrides(mut request: RequestMeta, overrides: ContinueOverrides) -> RequestMeta {
    if let Some(url) = overrides.url {
        request.url = url;
    }
    if let Some(method) = overrides.method {
        request.method = method;
    }
    if let Some(headers) = overrides.headers {
        request.headers = headers;
    }
    if let Some(post_data) = overrides.post_data {
        request.post_data = Some(post_data);
    }
    request
}

#[async_trait]
impl BrowserContext for SimContext {
    async fn new_page(&self) -> Result<Arc<dyn Page>> {
        let context = self
            .self_ref
            .upgrade()
            .ok_or_else(|| Error::Engine("context is gone".into()))?;
        Ok(SimPage::new(context))
    }

    async fn set_interception(&self, handler: Option<InterceptHandler>) -> Result<()> {
        *self.interception.lock() = handler;
        Ok(())
    }

    fn remote_object(&self) -> Arc<dyn RemoteObject> {
        Arc::new(SimObject {
            page: None,
            version: SIM_VERSION.to_owned(),
        })
    }

    async fn close(&self) -> Result<()> {
        *self.interception.lock() = None;
        Ok(())
    }
}

struct PageState {
    last_url: Option<String>,
    done: Option<i32>,
    waiters: Vec<oneshot::Sender<i32>>,
}

/// A simulated page.
pub struct SimPage {
    context: Arc<SimContext>,
    state: Mutex<PageState>,
    events: Mutex<Vec<String>>,
    covering: Mutex<bool>,
    self_ref: Weak<SimPage>,
}

impl SimPage {
    fn new(context: Arc<SimContext>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            context,
            state: Mutex::new(PageState {
                last_url: None,
                done: None,
                waiters: Vec::new(),
            }),
            events: Mutex::new(Vec::new()),
            covering: Mutex::new(false),
            self_ref: self_ref.clone(),
        })
    }

    /// Window events dispatched through evaluate, for assertions.
    pub fn dispatched_events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn dispatch_done(&self, exit_code: i32) {
        let mut state = self.state.lock();
        if state.done.is_some() {
            // First signal per navigation wins.
            return;
        }
        state.done = Some(exit_code);
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(exit_code);
        }
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        let resolved = self.context.resolve_url(url);
        {
            let mut state = self.state.lock();
            state.last_url = Some(resolved.clone());
            state.done = None;
            state.waiters.clear();
        }

        // The document load goes through the interception pipeline like
        // any other request.
        let document = self
            .context
            .dispatch_fetch(RequestMeta {
                url: resolved.clone(),
                method: "GET".into(),
                headers: Vec::new(),
                resource_type: "document".into(),
                is_navigation_request: true,
                post_data: None,
            })
            .await;
        match document {
            Ok(response) if response.status < 400 => {}
            Ok(response) => {
                tracing::debug!(target: "wp", status = response.status, "document load failed");
                self.dispatch_done(1);
                return Ok(());
            }
            Err(err) => {
                tracing::debug!(target: "wp", error = %err, "document load failed");
                self.dispatch_done(1);
                return Ok(());
            }
        }

        let world = PageWorld {
            context: Arc::clone(&self.context),
            page: self.self_ref.clone(),
            base_url: origin_of(&resolved),
        };
        let program = Arc::clone(&self.context.program);
        tokio::spawn(async move {
            program(world).await;
        });
        Ok(())
    }
}

fn origin_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            let host = parsed.host_str()?.to_owned();
            let port = parsed
                .port()
                .map(|port| format!(":{port}"))
                .unwrap_or_default();
            Some(format!("{}://{host}{port}", parsed.scheme()))
        })
        .unwrap_or_else(|| url.trim_end_matches('/').to_owned())
}

#[async_trait]
impl Page for SimPage {
    async fn goto(&self, url: &str) -> Result<()> {
        self.navigate(url).await
    }

    async fn reload(&self) -> Result<()> {
        let url = self
            .state
            .lock()
            .last_url
            .clone()
            .ok_or_else(|| Error::Engine("reload before navigation".into()))?;
        self.navigate(&url).await
    }

    async fn wait_done(&self) -> Result<i32> {
        let receiver = {
            let mut state = self.state.lock();
            if let Some(code) = state.done {
                return Ok(code);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            rx
        };
        receiver
            .await
            .map_err(|_| Error::Engine("page closed before done".into()))
    }

    fn supports_js_coverage(&self) -> bool {
        self.context.kind == BrowserKind::Chromium
    }

    async fn start_js_coverage(&self) -> Result<()> {
        *self.covering.lock() = true;
        Ok(())
    }

    async fn stop_js_coverage(&self) -> Result<Vec<serde_json::Value>> {
        if !*self.covering.lock() {
            return Err(Error::Engine("coverage was not started".into()));
        }
        *self.covering.lock() = false;
        let url = self
            .state
            .lock()
            .last_url
            .clone()
            .unwrap_or_default();
        Ok(vec![serde_json::json!({
            "url": url,
            "scriptId": "0",
            "functions": [],
        })])
    }

    fn remote_object(&self) -> Arc<dyn RemoteObject> {
        Arc::new(SimObject {
            page: Some(self.self_ref.clone()),
            version: SIM_VERSION.to_owned(),
        })
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.waiters.clear();
        Ok(())
    }
}

enum Decision {
    Fulfill(FulfillResponse),
    Continue(ContinueOverrides),
    Abort(String),
}

struct SimRoute {
    meta: RequestMeta,
    decision: Mutex<Option<oneshot::Sender<Decision>>>,
}

impl SimRoute {
    fn new(meta: RequestMeta) -> (Arc<dyn InterceptedRoute>, oneshot::Receiver<Decision>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                meta,
                decision: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    fn decide(&self, decision: Decision) -> Result<()> {
        match self.decision.lock().take() {
            Some(tx) => {
                let _ = tx.send(decision);
                Ok(())
            }
            None => Err(Error::Engine("route already decided".into())),
        }
    }
}

#[async_trait]
impl InterceptedRoute for SimRoute {
    fn request(&self) -> RequestMeta {
        self.meta.clone()
    }

    async fn abort(&self, error_code: &str) -> Result<()> {
        self.decide(Decision::Abort(error_code.to_owned()))
    }

    async fn continue_with(&self, overrides: ContinueOverrides) -> Result<()> {
        self.decide(Decision::Continue(overrides))
    }

    async fn fulfill_with(&self, response: FulfillResponse) -> Result<()> {
        self.decide(Decision::Fulfill(response))
    }
}

/// What a page program can reach: the simulated page's capabilities.
#[derive(Clone)]
pub struct PageWorld {
    context: Arc<SimContext>,
    page: Weak<SimPage>,
    base_url: String,
}

impl PageWorld {
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn bridge_url(&self) -> String {
        format!(
            "ws://{}{BRIDGE_PATH}",
            self.base_url.trim_start_matches("http://")
        )
    }

    /// Fetches through the page (subject to interception). Relative URLs
    /// resolve against the page's origin.
    pub async fn fetch(&self, request: FetchRequest) -> wp_client::Result<FetchResponse> {
        let meta = RequestMeta {
            url: self.context.resolve_url(&request.url),
            method: request.method,
            headers: request.headers,
            resource_type: "fetch".into(),
            is_navigation_request: false,
            post_data: request.body,
        };
        match self.context.dispatch_fetch(meta).await {
            Ok(response) => Ok(FetchResponse {
                status: response.status,
                headers: response.headers,
                body: response.body,
            }),
            Err(err) => Err(wp_client::Error::Env(err.to_string())),
        }
    }

    /// Reads the served entry and extracts the session UUID it carries,
    /// the way the real entry learns it at bundle time.
    pub async fn session_from_entry(&self) -> wp_client::Result<String> {
        let entry = self
            .fetch(FetchRequest::get(format!(
                "{}{}",
                self.base_url,
                crate::bundler::ENTRY_PATH
            )))
            .await?;
        let text = entry.text();
        let marker = "const sessionId = \"";
        let start = text
            .find(marker)
            .ok_or_else(|| wp_client::Error::Env("entry carries no session id".into()))?
            + marker.len();
        let end = text[start..]
            .find('"')
            .ok_or_else(|| wp_client::Error::Env("unterminated session id".into()))?;
        Ok(text[start..start + end].to_owned())
    }

    /// Opens the bridge: reads the session UUID from the entry, connects
    /// the WebSocket, and hands back the harness.
    pub async fn connect_harness(&self) -> wp_client::Result<Harness> {
        let session = self.session_from_entry().await?;
        let parts = wp_runtime::transport::ws::connect(&self.bridge_url()).await?;
        Harness::connect(parts, session, Arc::new(self.clone()))
    }

    /// Fires the page's done event.
    pub fn done(&self, exit_code: i32) {
        if let Some(page) = self.page.upgrade() {
            page.dispatch_done(exit_code);
        }
    }

    /// The page this world belongs to, for assertions.
    pub fn page(&self) -> Option<Arc<SimPage>> {
        self.page.upgrade()
    }
}

#[async_trait]
impl PageEnvironment for PageWorld {
    async fn fetch(&self, request: FetchRequest) -> wp_client::Result<FetchResponse> {
        PageWorld::fetch(self, request).await
    }

    fn dispatch_done(&self, exit_code: i32) {
        self.done(exit_code);
    }
}

/// Evaluate target for the simulated page and context. Answers a small
/// documented set of sources; anything else is reported as unsupported.
struct SimObject {
    page: Option<Weak<SimPage>>,
    version: String,
}

fn data(value: serde_json::Value) -> HostValue {
    HostValue::Data(RemoteValue::from_json(&value))
}

#[async_trait]
impl RemoteObject for SimObject {
    async fn invoke(&self, source: &NormalizedFn, arg: HostArg) -> Result<HostValue> {
        match source.raw() {
            "1 + 2" => Ok(data(serde_json::json!(3))),
            "(_, passed) => passed" => match arg.value.node() {
                ValueNode::Handle(id) => arg
                    .handles
                    .get(id)
                    .cloned()
                    .ok_or_else(|| Error::UnknownTarget(*id)),
                _ => Ok(HostValue::Data(arg.value)),
            },
            "() => ({ p: [1, 2] })" => Ok(data(serde_json::json!({ "p": [1, 2] }))),
            "(p) => p.context().browser().version()" => {
                Ok(data(serde_json::json!(self.version)))
            }
            src if src.starts_with("async (page, eventName)") => {
                let page = self
                    .page
                    .as_ref()
                    .and_then(Weak::upgrade)
                    .ok_or_else(|| Error::Engine("page is gone".into()))?;
                match arg.value.node() {
                    ValueNode::String(name) => {
                        page.events.lock().push(name.clone());
                        Ok(HostValue::Data(RemoteValue::undefined()))
                    }
                    other => Err(Error::Engine(format!(
                        "expected an event name, got {other:?}"
                    ))),
                }
            }
            other => Err(Error::Engine(format!(
                "the simulated engine cannot evaluate {other:?}"
            ))),
        }
    }

    async fn property(&self, _name: &str) -> Result<HostValue> {
        Ok(HostValue::Data(RemoteValue::undefined()))
    }

    async fn properties(&self) -> Result<Vec<(String, HostValue)>> {
        Ok(Vec::new())
    }
}
