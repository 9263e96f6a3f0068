//! The per-cycle device contract.
//!
//! [`Device`] is the statically dispatched contract every terminal type
//! implements: identity constants, construction against a registry client,
//! direct output writes and the cyclic `pdo_cycle`.  Its output record is an
//! associated fixed-size array, so the hot path is monomorphised per
//! terminal type.
//!
//! [`DynDevice`] is the object-safe view handed to the cyclic bus driver by
//! the [`DeviceCatalog`][crate::catalog::DeviceCatalog].  It costs exactly
//! one virtual call per device per tick; everything below that call is
//! static.

use std::sync::Arc;

use termbus_middleware::RegistryClient;
use termbus_types::{BusError, ChannelHealth, CycleError, DeviceIdentity, HealthEvent};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};

// ─────────────────────────────────────────────────────────────────────────────
// Process images
// ─────────────────────────────────────────────────────────────────────────────

/// A fixed-size process-data record as it sits on the wire.
pub trait ProcessImage: Default + Copy + Eq + AsRef<[u8]> + AsMut<[u8]> + std::fmt::Debug + Send + 'static {
    /// Encoded length in bytes.
    const LEN: usize;
}

impl<const N: usize> ProcessImage for [u8; N]
where
    [u8; N]: Default,
{
    const LEN: usize = N;
}

// ─────────────────────────────────────────────────────────────────────────────
// Static contract
// ─────────────────────────────────────────────────────────────────────────────

/// A bus slave driver.
pub trait Device: Send + Sized + 'static {
    const VENDOR_ID: u32;
    const PRODUCT_CODE: u32;
    const NAME: &'static str;
    /// Exact length of the input process data handed to [`Device::pdo_cycle`].
    const INPUT_SIZE: usize;

    /// Output record written every cycle.
    type OutputPdo: ProcessImage;

    /// Identity the binder matches against the hardware at `slave_index`.
    fn identify(slave_index: u16) -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: Self::VENDOR_ID,
            product_code: Self::PRODUCT_CODE,
            name: Self::NAME.to_string(),
            slave_index,
            instance: None,
        }
    }

    /// Bring the device up under `identity`.  Channel registrations are
    /// issued on `handle` and complete after this returns.
    ///
    /// # Errors
    ///
    /// Configuration errors that refuse the device, e.g.
    /// [`BusError::PdoSizeMismatch`].
    fn bind_as<C: RegistryClient>(handle: &Handle, client: &Arc<C>, identity: DeviceIdentity) -> Result<Self, BusError>;

    /// [`Device::bind_as`] with the type's own identity at `slave_index`.
    fn bind<C: RegistryClient>(handle: &Handle, client: &Arc<C>, slave_index: u16) -> Result<Self, BusError> {
        Self::bind_as(handle, client, Self::identify(slave_index))
    }

    fn identity(&self) -> &DeviceIdentity;

    /// Direct synchronous write of logical output `position`.
    fn set_output(&self, position: usize, value: bool) -> Result<(), BusError>;

    /// Exchange process data for one bus tick.
    ///
    /// Must not block, allocate or perform I/O.  An input length other than
    /// [`Device::INPUT_SIZE`] faults the device; a faulted device writes an
    /// all-zero output record and returns [`CycleError::Faulted`] from then on.
    fn pdo_cycle(&mut self, input: &[u8], output: &mut Self::OutputPdo) -> Result<(), CycleError>;

    fn is_faulted(&self) -> bool;

    /// Latch the fault state: every later cycle writes zeros and returns
    /// [`CycleError::Faulted`].
    fn latch_fault(&mut self);

    /// Per-channel health watchers, in logical channel order.
    fn health_watchers(&self) -> Vec<watch::Receiver<ChannelHealth>> {
        Vec::new()
    }

    /// Stream of channel health transitions, for devices with bindings.
    fn subscribe_health(&self) -> Option<broadcast::Receiver<HealthEvent>> {
        None
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Binder-side view
// ─────────────────────────────────────────────────────────────────────────────

/// Object-safe view of a [`Device`] used at the binder boundary.
pub trait DynDevice: Send {
    fn identity(&self) -> &DeviceIdentity;
    fn input_size(&self) -> usize;
    fn output_size(&self) -> usize;
    fn set_output(&self, position: usize, value: bool) -> Result<(), BusError>;
    /// One tick against raw process-image slices.
    ///
    /// An `output` slice of the wrong length latches the device's fault
    /// state, like a wrong input length does.
    fn cycle(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), CycleError>;
    fn is_faulted(&self) -> bool;
    fn health_watchers(&self) -> Vec<watch::Receiver<ChannelHealth>>;
    fn subscribe_health(&self) -> Option<broadcast::Receiver<HealthEvent>>;
}

impl<D: Device> DynDevice for D {
    fn identity(&self) -> &DeviceIdentity {
        Device::identity(self)
    }

    fn input_size(&self) -> usize {
        D::INPUT_SIZE
    }

    fn output_size(&self) -> usize {
        <D::OutputPdo as ProcessImage>::LEN
    }

    fn set_output(&self, position: usize, value: bool) -> Result<(), BusError> {
        Device::set_output(self, position, value)
    }

    fn cycle(&mut self, input: &[u8], output: &mut [u8]) -> Result<(), CycleError> {
        if output.len() != <D::OutputPdo as ProcessImage>::LEN {
            Device::latch_fault(self);
            output.fill(0);
            return Err(CycleError::OutputSizeMismatch {
                expected: <D::OutputPdo as ProcessImage>::LEN,
                actual: output.len(),
            });
        }
        let mut frame = <D::OutputPdo as Default>::default();
        let result = self.pdo_cycle(input, &mut frame);
        output.copy_from_slice(frame.as_ref());
        result
    }

    fn is_faulted(&self) -> bool {
        Device::is_faulted(self)
    }

    fn health_watchers(&self) -> Vec<watch::Receiver<ChannelHealth>> {
        Device::health_watchers(self)
    }

    fn subscribe_health(&self) -> Option<broadcast::Receiver<HealthEvent>> {
        Device::subscribe_health(self)
    }
}
