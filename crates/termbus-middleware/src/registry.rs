//! In-process signal/slot registry.
//!
//! [`SignalRegistry`] owns the names of every signal (publisher) and slot
//! (subscriber) in the process.  Wiring a slot to a signal is pure
//! configuration: [`SignalRegistry::connect`] names both ends, and every
//! value sent on the signal is delivered to each connected slot.
//!
//! # Delivery
//!
//! Each slot is backed by an unbounded Tokio mpsc channel, so delivery to
//! one slot is FIFO relative to its publisher and a slow slot never blocks
//! the publisher.  A slot is connected to at most one signal; connecting it
//! again moves it.  A slot connected to a signal that already carries a
//! value receives that value immediately.
//!
//! # Shutdown
//!
//! [`SignalRegistry::shutdown`] drops every slot sender.  Connected
//! receivers observe the end of their stream and further registrations
//! fail with [`BusError::RegistryUnavailable`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use termbus_types::{BusError, SlotInfo};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::{RegistryClient, SlotReceiver, SlotRelease};

// ────────────────────────────────────────────────────────────────────────────
// Shared state
// ────────────────────────────────────────────────────────────────────────────

struct SlotEntry {
    info: SlotInfo,
    sender: mpsc::UnboundedSender<bool>,
    signal: Option<String>,
}

struct SignalEntry {
    info: SlotInfo,
    last: Option<bool>,
}

#[derive(Default)]
struct State {
    slots: HashMap<String, SlotEntry>,
    signals: HashMap<String, SignalEntry>,
    closed: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
}

impl Shared {
    // Critical sections are short and never span an await.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SlotRelease for Shared {
    fn release(&self, name: &str) {
        if self.lock().slots.remove(name).is_some() {
            debug!(slot = %name, "slot released");
        }
    }
}

/// Shared signal/slot registry.  Clones share the same name space.
#[derive(Clone, Default)]
pub struct SignalRegistry {
    shared: Arc<Shared>,
}

impl SignalRegistry {
    /// An empty, open registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a publisher named `info.name`.
    ///
    /// # Errors
    ///
    /// [`BusError::NameTaken`] for a duplicate name,
    /// [`BusError::RegistryUnavailable`] after [`SignalRegistry::shutdown`].
    pub fn register_signal(&self, info: SlotInfo) -> Result<Signal, BusError> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(BusError::RegistryUnavailable);
        }
        if state.signals.contains_key(&info.name) {
            return Err(BusError::NameTaken(info.name));
        }
        let name = info.name.clone();
        state.signals.insert(name.clone(), SignalEntry { info, last: None });
        info!(signal = %name, "signal registered");
        Ok(Signal {
            name,
            registry: Arc::downgrade(&self.shared),
        })
    }

    /// Wire `slot` to `signal`.  Replaces any previous connection of the slot.
    ///
    /// # Errors
    ///
    /// [`BusError::UnknownSlot`] or [`BusError::UnknownSignal`] when either
    /// end is not registered.
    pub fn connect(&self, slot: &str, signal: &str) -> Result<(), BusError> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(BusError::RegistryUnavailable);
        }
        let last = match state.signals.get(signal) {
            Some(entry) => entry.last,
            None => return Err(BusError::UnknownSignal(signal.to_string())),
        };
        let entry = state
            .slots
            .get_mut(slot)
            .ok_or_else(|| BusError::UnknownSlot(slot.to_string()))?;
        entry.signal = Some(signal.to_string());
        if let Some(value) = last {
            // A closed receiver only means the slot is going away.
            let _ = entry.sender.send(value);
        }
        info!(%slot, %signal, "slot connected");
        Ok(())
    }

    /// Remove the connection of `slot`, if any.
    pub fn disconnect(&self, slot: &str) -> Result<(), BusError> {
        let mut state = self.shared.lock();
        let entry = state
            .slots
            .get_mut(slot)
            .ok_or_else(|| BusError::UnknownSlot(slot.to_string()))?;
        entry.signal = None;
        Ok(())
    }

    /// Metadata of every registered slot, sorted by name.
    pub fn slots(&self) -> Vec<SlotInfo> {
        let state = self.shared.lock();
        let mut slots: Vec<SlotInfo> = state.slots.values().map(|e| e.info.clone()).collect();
        slots.sort_by(|a, b| a.name.cmp(&b.name));
        slots
    }

    /// Metadata of every registered signal, sorted by name.
    pub fn signals(&self) -> Vec<SlotInfo> {
        let state = self.shared.lock();
        let mut signals: Vec<SlotInfo> = state.signals.values().map(|e| e.info.clone()).collect();
        signals.sort_by(|a, b| a.name.cmp(&b.name));
        signals
    }

    /// Drop every slot sender and refuse further registrations.
    pub fn shutdown(&self) {
        let mut state = self.shared.lock();
        state.closed = true;
        let slots = state.slots.len();
        state.slots.clear();
        state.signals.clear();
        warn!(slots, "signal registry shut down");
    }

    fn claim_slot(&self, info: SlotInfo) -> Result<SlotReceiver, BusError> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(BusError::RegistryUnavailable);
        }
        if state.slots.contains_key(&info.name) {
            warn!(slot = %info.name, "slot name already registered");
            return Err(BusError::NameTaken(info.name));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        let name = info.name.clone();
        state.slots.insert(
            name.clone(),
            SlotEntry {
                info,
                sender,
                signal: None,
            },
        );
        debug!(slot = %name, "slot registered");
        let release: Weak<Shared> = Arc::downgrade(&self.shared);
        Ok(SlotReceiver::with_release(name, receiver, release))
    }
}

#[async_trait]
impl RegistryClient for SignalRegistry {
    async fn register_slot(&self, info: SlotInfo) -> Result<SlotReceiver, BusError> {
        self.claim_slot(info)
    }
}

impl std::fmt::Debug for SignalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("SignalRegistry")
            .field("slots", &state.slots.len())
            .field("signals", &state.signals.len())
            .field("closed", &state.closed)
            .finish()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Signal handle
// ────────────────────────────────────────────────────────────────────────────

/// Publisher handle returned by [`SignalRegistry::register_signal`].
///
/// Holds the registry weakly; sending after the registry is gone fails with
/// [`BusError::RegistryUnavailable`].
#[derive(Debug, Clone)]
pub struct Signal {
    name: String,
    registry: Weak<Shared>,
}

impl Signal {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish `value` to every connected slot.
    ///
    /// Returns the number of slots the value was handed to.  Zero connected
    /// slots is a normal condition.
    pub fn send(&self, value: bool) -> Result<usize, BusError> {
        let shared = self.registry.upgrade().ok_or(BusError::RegistryUnavailable)?;
        let mut state = shared.lock();
        if state.closed {
            return Err(BusError::RegistryUnavailable);
        }
        let entry = state
            .signals
            .get_mut(&self.name)
            .ok_or_else(|| BusError::UnknownSignal(self.name.clone()))?;
        entry.last = Some(value);

        let delivered = state
            .slots
            .values()
            .filter(|slot| slot.signal.as_deref() == Some(self.name.as_str()))
            .filter(|slot| slot.sender.send(value).is_ok())
            .count();
        debug!(signal = %self.name, value, delivered, "signal sent");
        Ok(delivered)
    }
}
