//! Remote handle proxies.
//!
//! A [`Handle`] refers to a host-side object by its target-vector id. All
//! proxies for one id share a refcount (the `Arc` holding the per-id
//! state); when the last proxy drops, a best-effort dispose is sent if the
//! bridge is still open. Explicit [`dispose`](Handle::dispose) marks the
//! proxy dead immediately, and the final holder awaits the host's
//! acknowledgement.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::Value as JsonValue;

use wp_runtime::message::{HandleAction, HandleRequest, HandleResolve};
use wp_runtime::remote::{parse, serialize, RemoteValue, SerializedValue};

use crate::client::Inner;
use crate::error::{Error, Result};

/// Per-id state shared by every proxy for the same target.
pub(crate) struct HandleShared {
    id: u32,
    inner: Arc<Inner>,
    next_resolve: AtomicU32,
    disposed: AtomicBool,
}

impl HandleShared {
    pub(crate) fn new(id: u32, inner: Arc<Inner>) -> Self {
        Self {
            id,
            inner,
            next_resolve: AtomicU32::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    fn next_resolve(&self) -> u32 {
        self.next_resolve.fetch_add(1, Ordering::SeqCst)
    }
}

impl Drop for HandleShared {
    fn drop(&mut self) {
        if self.disposed.load(Ordering::SeqCst) {
            return;
        }
        // Last proxy collected: notify the host. A bridge that already
        // closed simply drops the notification.
        let request = HandleRequest {
            id: self.id,
            resolve_id: self.next_resolve(),
            action: HandleAction::Dispose,
            fn_source: None,
            arg: None,
            h: None,
            name: None,
        };
        let message = wp_runtime::message::BridgeMessage::Handle(
            wp_runtime::message::HandleMessage::Request(request),
        );
        if self.inner.sender.send(&message, None).is_err() {
            tracing::debug!(target: "wp", id = self.id, "dispose after bridge close dropped");
        }
    }
}

/// A disposable, remotely-evaluable reference to a host-side object.
pub struct Handle {
    shared: Arc<HandleShared>,
    disposed: AtomicBool,
}

impl Clone for Handle {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            disposed: AtomicBool::new(self.disposed.load(Ordering::SeqCst)),
        }
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.shared.id)
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish()
    }
}

/// An evaluate argument: any value graph, possibly containing handles.
pub struct EvalArg(pub(crate) RemoteValue);

impl EvalArg {
    pub fn undefined() -> Self {
        EvalArg(RemoteValue::undefined())
    }
}

impl Default for EvalArg {
    fn default() -> Self {
        Self::undefined()
    }
}

impl From<JsonValue> for EvalArg {
    fn from(value: JsonValue) -> Self {
        EvalArg(RemoteValue::from_json(&value))
    }
}

impl From<RemoteValue> for EvalArg {
    fn from(value: RemoteValue) -> Self {
        EvalArg(value)
    }
}

impl From<&Handle> for EvalArg {
    fn from(handle: &Handle) -> Self {
        let mut graph = wp_runtime::remote::ValueGraph::new();
        let root = graph.handle(handle.id());
        EvalArg(RemoteValue::new(graph, root))
    }
}

impl From<()> for EvalArg {
    fn from(_: ()) -> Self {
        Self::undefined()
    }
}

impl Handle {
    pub(crate) fn from_shared(shared: Arc<HandleShared>) -> Self {
        Self {
            shared,
            disposed: AtomicBool::new(false),
        }
    }

    /// The target-vector id this proxy refers to.
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    fn ensure_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) || self.shared.disposed.load(Ordering::SeqCst) {
            return Err(Error::HandleDisposed(self.shared.id));
        }
        Ok(())
    }

    async fn request(
        &self,
        action: HandleAction,
        fn_source: Option<&str>,
        arg: Option<EvalArg>,
        h: Option<bool>,
        name: Option<&str>,
    ) -> Result<HandleResolve> {
        self.ensure_live()?;
        let arg = match arg {
            Some(EvalArg(value)) => Some(serialize(&value.graph, value.root, None)?),
            None => None,
        };
        let request = HandleRequest {
            id: self.shared.id,
            resolve_id: self.shared.next_resolve(),
            action,
            fn_source: fn_source.map(str::to_owned),
            arg,
            h,
            name: name.map(str::to_owned),
        };
        self.shared.inner.send_handle_request(request).await
    }

    fn decode_value(resolve: HandleResolve) -> Result<RemoteValue> {
        let serialized: SerializedValue = serde_json::from_value(resolve.result)
            .map_err(wp_runtime::Error::Json)?;
        let (graph, root) = parse(&serialized, None)?;
        let value = RemoteValue::new(graph, root);
        if resolve.error {
            Err(Error::from_thrown(&value))
        } else {
            Ok(value)
        }
    }

    /// Extracts the client-side error for a resolve whose error flag is set.
    fn thrown_error(resolve: HandleResolve) -> Error {
        match Self::decode_value(resolve) {
            Err(err) => err,
            Ok(value) => Error::Remote {
                name: "Error".into(),
                message: format!("{:?}", value.node()),
                stack: None,
            },
        }
    }

    fn decode_id(resolve: HandleResolve) -> Result<u32> {
        if resolve.error {
            return Err(Self::thrown_error(resolve));
        }
        resolve
            .result
            .as_u64()
            .map(|id| id as u32)
            .ok_or_else(|| {
                Error::Runtime(wp_runtime::Error::Protocol(format!(
                    "expected a handle id, got {}",
                    resolve.result
                )))
            })
    }

    /// Evaluates `source` against the referenced object, returning the
    /// serialized result. Unserializable results surface as null on the
    /// host side.
    pub async fn evaluate(
        &self,
        source: &str,
        arg: impl Into<EvalArg>,
    ) -> Result<RemoteValue> {
        let resolve = self
            .request(
                HandleAction::Evaluate,
                Some(source),
                Some(arg.into()),
                Some(false),
                None,
            )
            .await?;
        Self::decode_value(resolve)
    }

    /// Evaluates `source` and registers the result as a new handle.
    pub async fn evaluate_handle(
        &self,
        source: &str,
        arg: impl Into<EvalArg>,
    ) -> Result<Handle> {
        let resolve = self
            .request(
                HandleAction::Evaluate,
                Some(source),
                Some(arg.into()),
                Some(true),
                None,
            )
            .await?;
        let id = Self::decode_id(resolve)?;
        Ok(self.shared.inner.handle_for(id))
    }

    /// Registers the named property (present or not) as a new handle.
    pub async fn get_property(&self, name: &str) -> Result<Handle> {
        let resolve = self
            .request(HandleAction::GetProperty, None, None, None, Some(name))
            .await?;
        let id = Self::decode_id(resolve)?;
        Ok(self.shared.inner.handle_for(id))
    }

    /// Registers every own enumerable property as a handle.
    pub async fn get_properties(&self) -> Result<Vec<(String, Handle)>> {
        let resolve = self
            .request(HandleAction::GetProperties, None, None, None, None)
            .await?;
        if resolve.error {
            return Err(Self::thrown_error(resolve));
        }
        let pairs: Vec<(String, u32)> = serde_json::from_value(resolve.result)
            .map_err(wp_runtime::Error::Json)?;
        Ok(pairs
            .into_iter()
            .map(|(name, id)| (name, self.shared.inner.handle_for(id)))
            .collect())
    }

    /// The referenced value's JSON projection.
    pub async fn json_value(&self) -> Result<JsonValue> {
        let resolve = self
            .request(HandleAction::JsonValue, None, None, None, None)
            .await?;
        let value = Self::decode_value(resolve)?;
        Ok(value.to_json()?)
    }

    /// Like [`json_value`](Self::json_value) but keeps the full graph, so
    /// sentinels like `undefined` stay observable.
    pub async fn remote_value(&self) -> Result<RemoteValue> {
        let resolve = self
            .request(HandleAction::JsonValue, None, None, None, None)
            .await?;
        Self::decode_value(resolve)
    }

    /// Releases this proxy. The final holder of the id awaits the host's
    /// acknowledgement; disposing an already-disposed proxy is a no-op.
    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst)
            || self.shared.disposed.load(Ordering::SeqCst)
        {
            return Ok(());
        }
        if Arc::strong_count(&self.shared) > 1 {
            // Other proxies still hold the id; only the refcount drops.
            return Ok(());
        }
        self.shared.disposed.store(true, Ordering::SeqCst);
        let request = HandleRequest {
            id: self.shared.id,
            resolve_id: self.shared.next_resolve(),
            action: HandleAction::Dispose,
            fn_source: None,
            arg: None,
            h: None,
            name: None,
        };
        let resolve = self.shared.inner.send_handle_request(request).await?;
        if resolve.error {
            return Err(Self::thrown_error(resolve));
        }
        Ok(())
    }
}
