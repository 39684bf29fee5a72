//! In-page test runtime for wrightplay.
//!
//! This crate is the browser side of the bridge expressed as a native
//! peer: handle proxies over host-side objects, the route client with its
//! LIFO handler stack, and the harness surface test code drives itself
//! through (`on_init`, `done`, `context_route`, `bypass_fetch`).
//!
//! The page capabilities the runtime sits on (fetch, the done event) come
//! in through [`PageEnvironment`], so the same runtime works inside a
//! simulated page as over a real socket.

mod client;
pub mod env;
pub mod error;
pub mod handle;
pub mod harness;
pub mod matcher;
pub mod route;

pub use env::{FetchRequest, FetchResponse, PageEnvironment};
pub use error::{Error, Result};
pub use handle::{EvalArg, Handle};
pub use harness::Harness;
pub use matcher::RouteMatcher;
pub use route::{
    route_handler, FulfillBody, FulfillOptions, RequestOverrides, RequestView, Route,
    RouteHandlerFn,
};
