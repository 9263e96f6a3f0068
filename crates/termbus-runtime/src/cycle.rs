//! [`CycleRunner`] – a stand-in for the cyclic bus driver.
//!
//! Devices are mounted in bus order.  Each mount reserves a contiguous range
//! of the input and output process images; both images are allocated while
//! mounting and never resized afterwards.  A tick hands every device its two
//! slices through one virtual call.
//!
//! A device whose cycle returns an error is quarantined: its output range is
//! zeroed on every later tick and it is never called again.  Other devices
//! keep cycling.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use termbus_hal::El2008;
//! use termbus_middleware::SignalRegistry;
//! use termbus_runtime::CycleRunner;
//! use tokio::runtime::Handle;
//!
//! # async fn demo() -> Result<(), termbus_types::BusError> {
//! let registry = Arc::new(SignalRegistry::new());
//! let mut runner = CycleRunner::new(Duration::from_millis(1));
//! let index = runner.mount(Box::new(El2008::new(&Handle::current(), &registry, 3)?));
//!
//! runner.device(index).expect("mounted").set_output(2, true)?;
//! runner.tick();
//! assert_eq!(runner.output_of(index), Some(&[0b0000_0010][..]));
//! # Ok(())
//! # }
//! ```

use std::ops::Range;
use std::time::{Duration, Instant};

use termbus_hal::DynDevice;
use termbus_types::BusError;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

// ────────────────────────────────────────────────────────────────────────────
// Mounted devices
// ────────────────────────────────────────────────────────────────────────────

struct Mounted {
    device: Box<dyn DynDevice>,
    input: Range<usize>,
    output: Range<usize>,
    quarantined: bool,
}

/// Tick counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub ticks: u64,
    pub overruns: u64,
    pub max_tick: Duration,
}

/// Owns the mounted devices and the bus process images.
pub struct CycleRunner {
    devices: Vec<Mounted>,
    input_image: Vec<u8>,
    output_image: Vec<u8>,
    overrun_threshold: Duration,
    stats: CycleStats,
}

impl CycleRunner {
    /// A runner that counts ticks longer than `overrun_threshold` as overruns.
    pub fn new(overrun_threshold: Duration) -> Self {
        Self {
            devices: Vec::new(),
            input_image: Vec::new(),
            output_image: Vec::new(),
            overrun_threshold,
            stats: CycleStats::default(),
        }
    }

    /// Append `device` to the bus and reserve its process data.
    ///
    /// Returns the device's mount index.
    pub fn mount(&mut self, device: Box<dyn DynDevice>) -> usize {
        let input = reserve(&mut self.input_image, device.input_size());
        let output = reserve(&mut self.output_image, device.output_size());
        info!(
            device = %device.identity(),
            input = ?input,
            output = ?output,
            "device mounted"
        );
        self.devices.push(Mounted {
            device,
            input,
            output,
            quarantined: false,
        });
        self.devices.len() - 1
    }

    /// Number of mounted devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Device at mount `index`.
    pub fn device(&self, index: usize) -> Option<&dyn DynDevice> {
        self.devices.get(index).map(|m| m.device.as_ref())
    }

    /// Mount index of the device at `slave_index`.
    pub fn find(&self, slave_index: u16) -> Option<usize> {
        self.devices
            .iter()
            .position(|m| m.device.identity().slave_index == slave_index)
    }

    /// Whole-bus input image, as the master would fill it from the wire.
    pub fn input_image_mut(&mut self) -> &mut [u8] {
        &mut self.input_image
    }

    /// Whole-bus output image produced by the last tick.
    pub fn output_image(&self) -> &[u8] {
        &self.output_image
    }

    /// Input range of the device at `index` within the bus image.
    pub fn input_of_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        let range = self.devices.get(index)?.input.clone();
        self.input_image.get_mut(range)
    }

    /// Output range of the device at `index` as of the last tick.
    pub fn output_of(&self, index: usize) -> Option<&[u8]> {
        let range = self.devices.get(index)?.output.clone();
        self.output_image.get(range)
    }

    /// `true` once a cycle error took the device at `index` out of the tick.
    pub fn is_quarantined(&self, index: usize) -> bool {
        self.devices.get(index).is_some_and(|m| m.quarantined)
    }

    /// `Err(DeviceFaulted)` once the device at `index` has been quarantined.
    pub fn ensure_healthy(&self, index: usize) -> Result<(), BusError> {
        match self.devices.get(index) {
            Some(m) if m.quarantined => Err(BusError::DeviceFaulted {
                slave_index: m.device.identity().slave_index,
            }),
            _ => Ok(()),
        }
    }

    /// Tick, overrun and quarantine counters so far.
    pub fn stats(&self) -> CycleStats {
        self.stats
    }

    /// Run one bus tick.  Returns the number of devices quarantined by it.
    pub fn tick(&mut self) -> usize {
        let started = Instant::now();
        let mut newly_faulted = 0;

        for mounted in &mut self.devices {
            let output = &mut self.output_image[mounted.output.clone()];
            if mounted.quarantined {
                output.fill(0);
                continue;
            }
            let input = &self.input_image[mounted.input.clone()];
            if let Err(err) = mounted.device.cycle(input, output) {
                output.fill(0);
                mounted.quarantined = true;
                newly_faulted += 1;
                error!(
                    device = %mounted.device.identity(),
                    error = %err,
                    "device cycle failed; quarantining"
                );
            }
        }

        let elapsed = started.elapsed();
        self.stats.ticks += 1;
        self.stats.max_tick = self.stats.max_tick.max(elapsed);
        if elapsed > self.overrun_threshold {
            self.stats.overruns += 1;
            warn!(
                elapsed_us = elapsed.as_micros() as u64,
                threshold_us = self.overrun_threshold.as_micros() as u64,
                "tick overran"
            );
        }
        newly_faulted
    }

    /// Drive `ticks` ticks from a `tokio` interval of `period`.
    pub async fn run_for(&mut self, period: Duration, ticks: u64) -> CycleStats {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        for _ in 0..ticks {
            interval.tick().await;
            self.tick();
        }
        self.stats
    }

    /// Like [`CycleRunner::run_for`], on a dedicated current-thread runtime
    /// owned by the calling thread.
    pub fn run_blocking(&mut self, period: Duration, ticks: u64) -> std::io::Result<CycleStats> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        Ok(runtime.block_on(self.run_for(period, ticks)))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Helpers
// ────────────────────────────────────────────────────────────────────────────

impl std::fmt::Debug for CycleRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let devices: Vec<String> = self
            .devices
            .iter()
            .map(|m| m.device.identity().to_string())
            .collect();
        f.debug_struct("CycleRunner")
            .field("devices", &devices)
            .field("input_len", &self.input_image.len())
            .field("output_len", &self.output_image.len())
            .field("stats", &self.stats)
            .finish()
    }
}

fn reserve(image: &mut Vec<u8>, len: usize) -> Range<usize> {
    let start = image.len();
    image.resize(start + len, 0);
    start..start + len
}
