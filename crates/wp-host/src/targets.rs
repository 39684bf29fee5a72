//! The host-side target vector.
//!
//! Handles are integer indices into this vector. Slots 0 and 1 are
//! reserved for the browsing context and the page; everything else is
//! appended by evaluate-with-handle and the property operations. Disposal
//! empties a slot but never reuses it within a session, so an id keeps
//! distinguishing "already disposed" from "never existed" by comparison
//! with the current length.

use wp_runtime::remote::HandleLookup;

use crate::engine::HostValue;
use crate::error::{Error, Result};

/// Append-only vector of host values addressed by handle id.
#[derive(Default)]
pub struct TargetVec {
    slots: Vec<Option<HostValue>>,
}

impl TargetVec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the reserved slots: id 0 is the browsing context, id 1 the
    /// page.
    pub fn seed(&mut self, context: HostValue, page: HostValue) {
        self.slots.clear();
        self.slots.push(Some(context));
        self.slots.push(Some(page));
    }

    /// Appends a value, returning its id.
    pub fn register(&mut self, value: HostValue) -> u32 {
        let id = self.slots.len() as u32;
        self.slots.push(Some(value));
        id
    }

    /// The value at `id`, distinguishing disposed from never-assigned ids.
    pub fn get(&self, id: u32) -> Result<HostValue> {
        match self.slots.get(id as usize) {
            Some(Some(value)) => Ok(value.clone()),
            Some(None) => Err(Error::TargetDisposed(id)),
            None => Err(Error::UnknownTarget(id)),
        }
    }

    /// Empties slot `id`. The slot index is never handed out again.
    pub fn dispose(&mut self, id: u32) -> Result<()> {
        match self.slots.get_mut(id as usize) {
            Some(slot) => {
                *slot = None;
                Ok(())
            }
            None => Err(Error::UnknownTarget(id)),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl HandleLookup for TargetVec {
    fn contains_handle(&self, id: u32) -> bool {
        matches!(self.slots.get(id as usize), Some(Some(_)))
    }
}
