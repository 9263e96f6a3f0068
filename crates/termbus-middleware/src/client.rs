//! The registry client seam.
//!
//! Devices never reach for a process-wide registry.  Every device is handed
//! an explicit [`RegistryClient`] at construction and registers one slot per
//! channel through it.  The registry answers with a [`SlotReceiver`] that
//! yields the values published to that slot, in publisher order.
//!
//! # Contract
//!
//! * `register_slot` – claims a unique slot name.  Fails with
//!   [`BusError::NameTaken`] when the name is already registered and with
//!   [`BusError::RegistryUnavailable`] when the registry cannot be reached.
//!
//! * The returned receiver ends (`recv` yields `None`) when the registry
//!   goes away.  Consumers keep their last value in that case.

use std::sync::Weak;

use async_trait::async_trait;
use termbus_types::{BusError, SlotInfo};
use tokio::sync::mpsc;

/// A handle to the process-wide signal/slot registry.
#[async_trait]
pub trait RegistryClient: Send + Sync + 'static {
    /// Register a boolean slot described by `info`.
    async fn register_slot(&self, info: SlotInfo) -> Result<SlotReceiver, BusError>;
}

/// Release hook run when a [`SlotReceiver`] is dropped, so the slot name
/// becomes available again.
pub trait SlotRelease: Send + Sync {
    fn release(&self, name: &str);
}

/// Receiving end of a registered slot.
///
/// Values arrive first-in-first-out relative to the single publisher
/// connected to the slot.  Dropping the receiver unregisters the slot.
pub struct SlotReceiver {
    name: String,
    receiver: mpsc::UnboundedReceiver<bool>,
    release: Option<Weak<dyn SlotRelease>>,
}

impl SlotReceiver {
    /// Build a receiver around a raw channel.  Used by registry
    /// implementations that do not need to be told about the drop.
    pub fn new(name: impl Into<String>, receiver: mpsc::UnboundedReceiver<bool>) -> Self {
        Self {
            name: name.into(),
            receiver,
            release: None,
        }
    }

    /// Like [`SlotReceiver::new`], but calls `release` when dropped.
    pub fn with_release(
        name: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<bool>,
        release: Weak<dyn SlotRelease>,
    ) -> Self {
        Self {
            name: name.into(),
            receiver,
            release: Some(release),
        }
    }

    /// Slot name this receiver was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait for the next delivered value.  `None` once the registry is gone.
    pub async fn recv(&mut self) -> Option<bool> {
        self.receiver.recv().await
    }
}

impl Drop for SlotReceiver {
    fn drop(&mut self) {
        if let Some(release) = self.release.take().and_then(|weak| weak.upgrade()) {
            release.release(&self.name);
        }
    }
}

impl std::fmt::Debug for SlotReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotReceiver").field("name", &self.name).finish()
    }
}
