//! The automation-engine seam.
//!
//! The host core never talks to a concrete browser engine; it drives these
//! traits. A production adapter binds them to a real automation engine, and
//! the [`testing`](crate::testing) module binds them to an in-memory
//! simulation for the integration suite.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use wp_runtime::expr::NormalizedFn;
use wp_runtime::message::HeaderEntry;
use wp_runtime::remote::RemoteValue;

use crate::error::{Error, Result};

/// The browsers a session can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrowserKind {
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserKind::Chromium => "chromium",
            BrowserKind::Firefox => "firefox",
            BrowserKind::Webkit => "webkit",
        }
    }
}

impl FromStr for BrowserKind {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "chromium" => Ok(BrowserKind::Chromium),
            "firefox" => Ok(BrowserKind::Firefox),
            "webkit" => Ok(BrowserKind::Webkit),
            other => Err(Error::Engine(format!("unknown browser: {other}"))),
        }
    }
}

impl std::fmt::Display for BrowserKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for launching an engine.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub headless: bool,
    pub devtools: bool,
    /// Engine-specific server options, passed through opaquely.
    pub server_options: Option<serde_json::Value>,
}

/// Options for opening a browsing context.
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    /// Base URL relative requests resolve against.
    pub base_url: Option<String>,
}

/// A value held on the host: either plain data or an engine-side object.
#[derive(Clone)]
pub enum HostValue {
    Data(RemoteValue),
    Object(Arc<dyn RemoteObject>),
}

impl std::fmt::Debug for HostValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostValue::Data(value) => f.debug_tuple("Data").field(&value.node()).finish(),
            HostValue::Object(_) => f.write_str("Object"),
        }
    }
}

/// Deserialized evaluate argument: the value graph plus the host values for
/// every handle id the graph mentions.
pub struct HostArg {
    pub value: RemoteValue,
    pub handles: HashMap<u32, HostValue>,
}

/// An engine-side object that evaluate calls can target.
#[async_trait]
pub trait RemoteObject: Send + Sync {
    /// Applies a normalized function source to this object with `arg`.
    async fn invoke(&self, source: &NormalizedFn, arg: HostArg) -> Result<HostValue>;

    /// The named own property (missing properties are `undefined`).
    async fn property(&self, name: &str) -> Result<HostValue>;

    /// All own enumerable string-keyed properties.
    async fn properties(&self) -> Result<Vec<(String, HostValue)>>;
}

/// A running browser engine.
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    fn kind(&self) -> BrowserKind;

    fn version(&self) -> String;

    async fn new_context(&self, options: ContextOptions) -> Result<Arc<dyn BrowserContext>>;

    async fn close(&self) -> Result<()>;
}

/// Future returned by an interception callback.
pub type InterceptFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The universal matcher the route host attaches to a context.
pub type InterceptHandler =
    Arc<dyn Fn(Arc<dyn InterceptedRoute>) -> InterceptFuture + Send + Sync>;

/// A browsing context.
#[async_trait]
pub trait BrowserContext: Send + Sync {
    async fn new_page(&self) -> Result<Arc<dyn Page>>;

    /// Installs (or removes) the universal interception handler. Every
    /// request made by any page in the context flows through it.
    async fn set_interception(&self, handler: Option<InterceptHandler>) -> Result<()>;

    /// This context as an evaluate target.
    fn remote_object(&self) -> Arc<dyn RemoteObject>;

    async fn close(&self) -> Result<()>;
}

/// A page within a context.
#[async_trait]
pub trait Page: Send + Sync {
    async fn goto(&self, url: &str) -> Result<()>;

    async fn reload(&self) -> Result<()>;

    /// Resolves with the exit code of the current navigation: the page's
    /// done event, or 1 when loading or initialization fails.
    async fn wait_done(&self) -> Result<i32>;

    fn supports_js_coverage(&self) -> bool {
        false
    }

    async fn start_js_coverage(&self) -> Result<()> {
        Err(Error::Engine("JS coverage not supported".into()))
    }

    async fn stop_js_coverage(&self) -> Result<Vec<serde_json::Value>> {
        Err(Error::Engine("JS coverage not supported".into()))
    }

    /// This page as an evaluate target.
    fn remote_object(&self) -> Arc<dyn RemoteObject>;

    async fn close(&self) -> Result<()>;
}

/// A request intercepted by the universal matcher, parked until a decision.
#[async_trait]
pub trait InterceptedRoute: Send + Sync {
    fn request(&self) -> RequestMeta;

    async fn abort(&self, error_code: &str) -> Result<()>;

    async fn continue_with(&self, overrides: ContinueOverrides) -> Result<()>;

    async fn fulfill_with(&self, response: FulfillResponse) -> Result<()>;
}

/// Metadata of an intercepted request.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub url: String,
    pub method: String,
    pub headers: Vec<HeaderEntry>,
    pub resource_type: String,
    pub is_navigation_request: bool,
    pub post_data: Option<Vec<u8>>,
}

/// Request mutations applied by a continue.
#[derive(Debug, Clone, Default)]
pub struct ContinueOverrides {
    pub url: Option<String>,
    pub method: Option<String>,
    pub headers: Option<Vec<HeaderEntry>>,
    pub post_data: Option<Vec<u8>>,
}

/// The response a fulfill serves.
#[derive(Debug, Clone)]
pub struct FulfillResponse {
    pub status: u16,
    pub headers: Vec<HeaderEntry>,
    pub body: Vec<u8>,
}

/// Launches the engine for `kind`. Engine adapters are external
/// collaborators; without one linked this reports the gap instead of
/// guessing.
pub async fn launch(kind: BrowserKind, _options: LaunchOptions) -> Result<Arc<dyn BrowserEngine>> {
    Err(Error::EngineUnavailable(kind.as_str().to_owned()))
}
