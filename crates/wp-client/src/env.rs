//! The page environment seam.
//!
//! In a browser the runtime sits on top of `fetch` and window events. A
//! native peer supplies those capabilities through this trait instead; the
//! simulated engine's pages implement it over the interception pipeline.

use async_trait::async_trait;

use wp_runtime::message::HeaderEntry;

use crate::error::Result;

/// Capabilities the harness borrows from the page it runs in.
#[async_trait]
pub trait PageEnvironment: Send + Sync {
    /// Performs a network fetch from the page, subject to interception.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse>;

    /// Fires the page's done event with the run's exit code.
    fn dispatch_done(&self, exit_code: i32);
}

/// A fetch issued by in-page code.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<HeaderEntry>,
    pub body: Option<Vec<u8>>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            url: url.into(),
            method: "POST".into(),
            headers: Vec::new(),
            body: Some(body),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(HeaderEntry {
            name: name.into(),
            value: value.into(),
        });
        self
    }
}

/// The response surfaced back to in-page code.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: Vec<HeaderEntry>,
    pub body: Vec<u8>,
}

impl FetchResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
            .map(|entry| entry.value.as_str())
    }

    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
