//! The bundle HTTP server.
//!
//! Serves built artifacts from memory, falls back to the static assets
//! directory and then the working directory, and upgrades the reserved
//! bridge path to the WebSocket bridge. Requests arriving while a build is
//! in flight wait for it to finish before being served.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::bridge::{self, Session, BRIDGE_PATH};
use crate::bundler::{BuildOutput, BuiltFile};
use crate::error::{Error, Result};

/// Filesystem roots the server falls back to after the built map.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub cwd: PathBuf,
    pub static_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildStatus {
    Building,
    Ready,
}

struct ServerState {
    built: RwLock<HashMap<String, BuiltFile>>,
    status: watch::Sender<BuildStatus>,
    config: ServerConfig,
    session: Arc<Session>,
}

/// A running bundle server.
pub struct BundleServer {
    state: Arc<ServerState>,
    addr: SocketAddr,
    previous: Mutex<Option<BuildOutput>>,
}

impl BundleServer {
    /// Binds an ephemeral local port and starts serving. The server starts
    /// in the building state; requests wait until the first
    /// [`finish_build`](Self::finish_build).
    pub async fn start(config: ServerConfig, session: Arc<Session>) -> Result<Self> {
        let (status, _) = watch::channel(BuildStatus::Building);
        let state = Arc::new(ServerState {
            built: RwLock::new(HashMap::new()),
            status,
            config,
            session,
        });

        let app = Router::new()
            .route(BRIDGE_PATH, get(bridge_upgrade))
            .fallback(serve_path)
            .with_state(Arc::clone(&state));

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|err| Error::Server(format!("bind failed: {err}")))?;
        let addr = listener
            .local_addr()
            .map_err(|err| Error::Server(format!("no local addr: {err}")))?;

        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!(target: "wp", error = %err, "bundle server stopped");
            }
        });

        tracing::debug!(target: "wp", %addr, "bundle server listening");
        Ok(Self {
            state,
            addr,
            previous: Mutex::new(None),
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn bridge_url(&self) -> String {
        format!("ws://{}{BRIDGE_PATH}", self.addr)
    }

    /// Marks a build as in flight; requests block until it finishes.
    pub fn begin_build(&self) {
        self.state.status.send_replace(BuildStatus::Building);
    }

    /// Installs a build outcome. A failed build keeps the previous
    /// artifacts in place so reruns retry against them. Returns whether
    /// the outputs differ from the previous successful build.
    pub fn finish_build(&self, outcome: Result<BuildOutput>) -> Result<bool> {
        let result = match outcome {
            Ok(output) => {
                let mut previous = self.previous.lock();
                let changed = previous
                    .as_ref()
                    .map_or(true, |old| output.changed_from(old));
                *self.state.built.write() = output.files.clone();
                *previous = Some(output);
                Ok(changed)
            }
            Err(err) => Err(err),
        };
        self.state.status.send_replace(BuildStatus::Ready);
        result
    }

    /// A built artifact's bytes, for source-map consumers.
    pub fn built_file(&self, path: &str) -> Option<Vec<u8>> {
        self.state
            .built
            .read()
            .get(path)
            .map(|file| file.content.clone())
    }
}

async fn bridge_upgrade(
    State(state): State<Arc<ServerState>>,
    ws: WebSocketUpgrade,
) -> Response {
    let session = Arc::clone(&state.session);
    ws.protocols([wp_runtime::transport::ws::SUBPROTOCOL])
        .on_upgrade(move |socket| bridge::serve_socket(session, socket))
}

async fn serve_path(State(state): State<Arc<ServerState>>, uri: Uri) -> Response {
    // Block until any in-flight build completes.
    let mut status = state.status.subscribe();
    while *status.borrow() == BuildStatus::Building {
        if status.changed().await.is_err() {
            break;
        }
    }

    let path = uri.path();
    if path.contains("..") {
        return StatusCode::NOT_FOUND.into_response();
    }
    let lookup = if path == "/" { "/index.html" } else { path };

    if let Some(file) = state.built.read().get(lookup) {
        return file_response(lookup, file.content.clone());
    }

    let relative = lookup.trim_start_matches('/');
    let mut roots = Vec::new();
    if let Some(static_dir) = &state.config.static_dir {
        roots.push(static_dir.clone());
    }
    roots.push(state.config.cwd.clone());
    for root in roots {
        let candidate = root.join(relative);
        if candidate.is_file() {
            match tokio::fs::read(&candidate).await {
                Ok(content) => return file_response(lookup, content),
                Err(err) => {
                    tracing::warn!(target: "wp", path = %candidate.display(), error = %err, "static read failed");
                }
            }
        }
    }

    (StatusCode::NOT_FOUND, format!("not found: {path}")).into_response()
}

fn file_response(path: &str, content: Vec<u8>) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type(path))
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(content))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn content_type(path: &str) -> &'static str {
    let extension = std::path::Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("");
    match extension {
        "html" => "text/html; charset=utf-8",
        "js" | "mjs" => "application/javascript; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "json" | "map" => "application/json; charset=utf-8",
        "wasm" => "application/wasm",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "svg" => "image/svg+xml",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(pairs: &[(&str, &str)]) -> BuildOutput {
        BuildOutput {
            files: pairs
                .iter()
                .map(|(path, text)| {
                    ((*path).to_owned(), BuiltFile::new(text.as_bytes().to_vec()))
                })
                .collect(),
        }
    }

    async fn get_text(url: &str) -> (u16, String) {
        let response = reqwest::get(url).await.unwrap();
        let status = response.status().as_u16();
        (status, response.text().await.unwrap())
    }

    #[tokio::test]
    async fn serves_built_artifacts_with_charset() {
        let dir = tempfile::tempdir().unwrap();
        let server = BundleServer::start(
            ServerConfig {
                cwd: dir.path().to_owned(),
                static_dir: None,
            },
            Session::new(),
        )
        .await
        .unwrap();
        server
            .finish_build(Ok(output(&[("/app.js", "console.log(1)")])))
            .unwrap();

        let response = reqwest::get(format!("{}/app.js", server.base_url()))
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .unwrap()
                .to_str()
                .unwrap(),
            "application/javascript; charset=utf-8"
        );
        assert_eq!(response.text().await.unwrap(), "console.log(1)");
    }

    #[tokio::test]
    async fn falls_back_to_static_dir_then_cwd() {
        let cwd = tempfile::tempdir().unwrap();
        let assets = tempfile::tempdir().unwrap();
        std::fs::write(assets.path().join("fixture.txt"), "from assets").unwrap();
        std::fs::write(cwd.path().join("local.txt"), "from cwd").unwrap();

        let server = BundleServer::start(
            ServerConfig {
                cwd: cwd.path().to_owned(),
                static_dir: Some(assets.path().to_owned()),
            },
            Session::new(),
        )
        .await
        .unwrap();
        server.finish_build(Ok(BuildOutput::default())).unwrap();

        let (status, text) = get_text(&format!("{}/fixture.txt", server.base_url())).await;
        assert_eq!((status, text.as_str()), (200, "from assets"));
        let (status, text) = get_text(&format!("{}/local.txt", server.base_url())).await;
        assert_eq!((status, text.as_str()), (200, "from cwd"));
        let (status, _) = get_text(&format!("{}/missing.txt", server.base_url())).await;
        assert_eq!(status, 404);
    }

    #[tokio::test]
    async fn requests_wait_for_the_in_flight_build() {
        let dir = tempfile::tempdir().unwrap();
        let server = Arc::new(
            BundleServer::start(
                ServerConfig {
                    cwd: dir.path().to_owned(),
                    static_dir: None,
                },
                Session::new(),
            )
            .await
            .unwrap(),
        );

        // Server starts building; the request must not complete until the
        // build is finished.
        let url = format!("{}/late.js", server.base_url());
        let fetch = tokio::spawn(async move { get_text(&url).await });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!fetch.is_finished());

        server
            .finish_build(Ok(output(&[("/late.js", "ready")])))
            .unwrap();
        let (status, text) = fetch.await.unwrap();
        assert_eq!((status, text.as_str()), (200, "ready"));
    }

    #[tokio::test]
    async fn failed_build_keeps_previous_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let server = BundleServer::start(
            ServerConfig {
                cwd: dir.path().to_owned(),
                static_dir: None,
            },
            Session::new(),
        )
        .await
        .unwrap();
        server
            .finish_build(Ok(output(&[("/app.js", "v1")])))
            .unwrap();

        server.begin_build();
        let failed = server.finish_build(Err(Error::Bundler("syntax error".into())));
        assert!(failed.is_err());

        let (status, text) = get_text(&format!("{}/app.js", server.base_url())).await;
        assert_eq!((status, text.as_str()), (200, "v1"));
    }

    #[tokio::test]
    async fn change_detection_tracks_output_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let server = BundleServer::start(
            ServerConfig {
                cwd: dir.path().to_owned(),
                static_dir: None,
            },
            Session::new(),
        )
        .await
        .unwrap();
        assert!(server
            .finish_build(Ok(output(&[("/a.js", "one")])))
            .unwrap());
        assert!(!server
            .finish_build(Ok(output(&[("/a.js", "one")])))
            .unwrap());
        assert!(server
            .finish_build(Ok(output(&[("/a.js", "two")])))
            .unwrap());
    }
}
