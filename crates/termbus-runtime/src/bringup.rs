//! Bus bring-up from a [`CycleConfig`].
//!
//! For each configured slave, in bus order: resolve a driver through the
//! [`DeviceCatalog`], construct it and mount it on a fresh [`CycleRunner`].
//! Once every channel registration has settled (or the registration timeout
//! expires) the configured wiring is applied to the registry.
//!
//! Nothing here is fatal per slave.  Unknown identities, refused devices and
//! wiring that cannot be applied are reported in [`BringUp`] and logged.

use std::collections::HashMap;
use std::sync::Arc;

use termbus_hal::DeviceCatalog;
use termbus_middleware::{Signal, SignalRegistry};
use termbus_types::{BusError, ChannelHealth, SlotInfo};
use tokio::runtime::Handle;
use tracing::{info, instrument, warn};

use crate::config::{CycleConfig, WiringConfig};
use crate::cycle::CycleRunner;

/// Result of [`bring_up`].
#[derive(Debug)]
pub struct BringUp {
    /// Runner holding every mounted device, in bus order.
    pub runner: CycleRunner,
    /// Publisher handles for every signal named in the wiring.
    pub signals: HashMap<String, Signal>,
    /// Slaves with no matching driver.
    pub unbound: Vec<u16>,
    /// Slaves whose driver refused to come up.
    pub refused: Vec<(u16, BusError)>,
    /// Wiring entries that could not be applied.
    pub unwired: Vec<(WiringConfig, BusError)>,
}

/// Mount every configured slave and apply the wiring.
///
/// # Errors
///
/// Only [`BusError::Config`] from validation; per-slave failures land in
/// [`BringUp`].
#[instrument(skip_all, fields(slaves = config.slaves.len()))]
pub async fn bring_up(
    config: &CycleConfig,
    handle: &Handle,
    registry: &Arc<SignalRegistry>,
    catalog: &DeviceCatalog<SignalRegistry>,
) -> Result<BringUp, BusError> {
    config.validate()?;

    let mut runner = CycleRunner::new(config.overrun_threshold());
    let mut unbound = Vec::new();
    let mut refused = Vec::new();

    for slave in &config.slaves {
        let bound = catalog.bind_named(
            handle,
            registry,
            slave.vendor_id,
            slave.product_code,
            slave.slave_index,
            slave.name.as_deref(),
        );
        match bound {
            Ok(Some(device)) => {
                runner.mount(device);
            }
            Ok(None) => unbound.push(slave.slave_index),
            Err(err) => {
                warn!(slave_index = slave.slave_index, error = %err, "device refused");
                refused.push((slave.slave_index, err));
            }
        }
    }

    settle(&runner, config).await;

    let mut signals = HashMap::new();
    let mut unwired = Vec::new();
    for wiring in &config.wiring {
        match wire(registry, &mut signals, wiring) {
            Ok(()) => info!(signal = %wiring.signal, slot = %wiring.slot, "wired"),
            Err(err) => {
                warn!(signal = %wiring.signal, slot = %wiring.slot, error = %err, "wiring not applied");
                unwired.push((wiring.clone(), err));
            }
        }
    }

    info!(
        mounted = runner.len(),
        unbound = unbound.len(),
        refused = refused.len(),
        unwired = unwired.len(),
        "bus brought up"
    );
    Ok(BringUp {
        runner,
        signals,
        unbound,
        refused,
        unwired,
    })
}

/// Wait until no channel is `Pending`, bounded by the registration timeout.
async fn settle(runner: &CycleRunner, config: &CycleConfig) {
    let watchers: Vec<_> = (0..runner.len())
        .filter_map(|index| runner.device(index))
        .flat_map(|device| device.health_watchers())
        .collect();

    let all_settled = async {
        for mut rx in watchers {
            // A dropped sender means the binding is gone; nothing to wait for.
            let _ = rx.wait_for(|h| *h != ChannelHealth::Pending).await;
        }
    };
    if tokio::time::timeout(config.registration_timeout(), all_settled)
        .await
        .is_err()
    {
        warn!(
            timeout_ms = config.registration_timeout_ms,
            "channel registrations still pending"
        );
    }
}

fn wire(
    registry: &SignalRegistry,
    signals: &mut HashMap<String, Signal>,
    wiring: &WiringConfig,
) -> Result<(), BusError> {
    if !signals.contains_key(&wiring.signal) {
        let signal = registry.register_signal(SlotInfo::signal(
            wiring.signal.clone(),
            "declared by bus wiring",
        ))?;
        signals.insert(wiring.signal.clone(), signal);
    }
    registry.connect(&wiring.slot, &wiring.signal)
}
