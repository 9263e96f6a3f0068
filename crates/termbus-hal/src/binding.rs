//! [`ChannelBinding`] – one slot per logical channel, bridging the signal
//! fabric to a bit of [`OutputStates`].
//!
//! Each binding runs a small task on the executor handed to the device:
//!
//! 1. upgrade the weak registry handle and request the slot;
//! 2. report [`ChannelHealth::Bound`] or [`ChannelHealth::RegistrationFailed`];
//!    a taken name or an unreachable registry is retried with a doubling
//!    delay, so the channel binds once the name is freed;
//! 3. apply every delivered value to its bit, last write wins;
//! 4. report [`ChannelHealth::Stalled`] if the registry drops the slot.
//!
//! Every state mutation and health report from the task goes through the
//! device's [`Gate`].  Closing the gate waits for an in-flight update to
//! finish and turns all later ones into no-ops, so nothing a binding does
//! is observable once device teardown has begun.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use termbus_middleware::RegistryClient;
use termbus_types::{BusError, ChannelHealth, HealthEvent, SlotInfo};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::output_states::OutputStates;

// ────────────────────────────────────────────────────────────────────────────
// Teardown gate
// ────────────────────────────────────────────────────────────────────────────

/// Teardown barrier shared by a device and its bindings.
#[derive(Debug)]
pub struct Gate {
    open: RwLock<bool>,
}

impl Gate {
    /// A gate that starts open.
    pub fn new() -> Self {
        Self {
            open: RwLock::new(true),
        }
    }

    /// Run `f` unless the gate is closed.  Returns `false` when closed.
    pub fn pass(&self, f: impl FnOnce()) -> bool {
        let open = self.open.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *open {
            f();
        }
        *open
    }

    /// Close the gate, waiting for any in-flight [`Gate::pass`] to return.
    pub fn close(&self) {
        *self.open.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = false;
    }

    /// `false` once [`Gate::close`] has run.
    pub fn is_open(&self) -> bool {
        *self.open.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Binding
// ────────────────────────────────────────────────────────────────────────────

/// State a binding shares with its owning device.
#[derive(Clone)]
pub struct BindingContext {
    pub slave_index: u16,
    pub states: Arc<OutputStates>,
    pub gate: Arc<Gate>,
    pub events: broadcast::Sender<HealthEvent>,
}

/// Subscription endpoint of one logical channel.
///
/// Owned by its device; dropping it aborts the delivery task, which in turn
/// releases the slot name in the registry.
pub struct ChannelBinding {
    position: usize,
    slot: String,
    health: watch::Receiver<ChannelHealth>,
    deliveries: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl ChannelBinding {
    /// Issue the registration for `info` and return immediately.
    pub fn spawn<C: RegistryClient>(
        handle: &Handle,
        client: Weak<C>,
        info: SlotInfo,
        position: usize,
        ctx: BindingContext,
    ) -> Self {
        let slot = info.name.clone();
        let (health_tx, health) = watch::channel(ChannelHealth::Pending);
        let deliveries = Arc::new(AtomicU64::new(0));

        let reporter = HealthReporter {
            position,
            slot: slot.clone(),
            ctx: ctx.clone(),
            health: health_tx,
        };
        let task = handle.spawn(deliver(client, info, position, ctx, reporter, Arc::clone(&deliveries)));

        Self {
            position,
            slot,
            health,
            deliveries,
            task,
        }
    }

    /// Logical channel index this binding drives.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Registered slot name, `"{device}.{pin}"`.
    pub fn slot(&self) -> &str {
        &self.slot
    }

    /// Latest reported health.
    pub fn health(&self) -> ChannelHealth {
        self.health.borrow().clone()
    }

    /// Watch handle on this channel's health.
    pub fn health_receiver(&self) -> watch::Receiver<ChannelHealth> {
        self.health.clone()
    }

    /// Number of values applied to the output bit so far.
    pub fn deliveries(&self) -> u64 {
        self.deliveries.load(Ordering::Acquire)
    }
}

impl Drop for ChannelBinding {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for ChannelBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelBinding")
            .field("position", &self.position)
            .field("slot", &self.slot)
            .field("health", &*self.health.borrow())
            .finish()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Delivery task
// ────────────────────────────────────────────────────────────────────────────

struct HealthReporter {
    position: usize,
    slot: String,
    ctx: BindingContext,
    health: watch::Sender<ChannelHealth>,
}

impl HealthReporter {
    fn report(&self, health: ChannelHealth) -> bool {
        self.ctx.gate.pass(|| {
            self.health.send_replace(health.clone());
            let event = HealthEvent::new(self.ctx.slave_index, self.position, self.slot.clone(), health);
            // No subscriber is a normal condition.
            let _ = self.ctx.events.send(event);
        })
    }
}

/// First retry delay after a failed registration.
const RETRY_INITIAL: Duration = Duration::from_millis(10);
/// Ceiling for the doubling retry delay.
const RETRY_MAX: Duration = Duration::from_secs(1);

fn retryable(err: &BusError) -> bool {
    matches!(err, BusError::NameTaken(_) | BusError::RegistryUnavailable)
}

async fn deliver<C: RegistryClient>(
    client: Weak<C>,
    info: SlotInfo,
    position: usize,
    ctx: BindingContext,
    reporter: HealthReporter,
    deliveries: Arc<AtomicU64>,
) {
    let slot = info.name.clone();
    let mut backoff = RETRY_INITIAL;
    let mut last_reason: Option<String> = None;

    let mut receiver = loop {
        let Some(registry) = client.upgrade() else {
            // The registry is gone for good.
            warn!(%slot, position, "registry dropped before registration; channel stays at default");
            reporter.report(ChannelHealth::RegistrationFailed {
                reason: BusError::RegistryUnavailable.to_string(),
            });
            return;
        };
        let registered = registry.register_slot(info.clone()).await;
        drop(registry);

        match registered {
            Ok(receiver) => {
                debug!(%slot, position, "slot bound");
                if !reporter.report(ChannelHealth::Bound) {
                    return;
                }
                break receiver;
            }
            Err(err) => {
                let reason = err.to_string();
                if last_reason.as_deref() != Some(reason.as_str()) {
                    warn!(%slot, position, error = %err, "slot registration failed; channel stays at default");
                    if !reporter.report(ChannelHealth::RegistrationFailed { reason: reason.clone() }) {
                        return;
                    }
                    last_reason = Some(reason);
                }
                if !retryable(&err) {
                    return;
                }
                tokio::time::sleep(backoff).await;
                if !ctx.gate.is_open() {
                    return;
                }
                backoff = (backoff * 2).min(RETRY_MAX);
            }
        }
    };

    while let Some(value) = receiver.recv().await {
        let applied = ctx.gate.pass(|| {
            // Position was validated when the device allocated its bindings.
            if ctx.states.set(position, value).is_ok() {
                deliveries.fetch_add(1, Ordering::AcqRel);
            }
        });
        if !applied {
            return;
        }
    }

    info!(%slot, position, "registry dropped slot; holding last value");
    reporter.report(ChannelHealth::Stalled);
}
