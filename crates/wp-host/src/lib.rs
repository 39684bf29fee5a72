//! Host driver for wrightplay.
//!
//! The host bundles user sources into a single browser entry, serves
//! them, drives a page to load the entry, and then acts as the remote
//! peer for the in-page runtime: handle evaluations against host-side
//! objects, network interception decisions, coverage, and reruns. The
//! concrete automation engine and bundler are adapters; the
//! [`testing`] module provides in-memory stand-ins for both sides of
//! that seam.

pub mod bridge;
pub mod bundler;
pub mod coverage;
pub mod engine;
pub mod error;
mod handle;
mod route;
pub mod runner;
pub mod server;
pub mod sourcemap;
pub mod targets;
pub mod testing;
pub mod watch;

pub use bridge::{Session, BRIDGE_PATH};
pub use bundler::{BuildOutput, BuildRequest, Bundler, BuiltFile, PassthroughBundler};
pub use engine::{BrowserEngine, BrowserKind, ContextOptions, LaunchOptions};
pub use error::{Error, Result};
pub use runner::{RunConfig, Runner};
pub use server::{BundleServer, ServerConfig};
