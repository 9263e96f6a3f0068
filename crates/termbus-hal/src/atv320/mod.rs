//! [`Atv320`] – Schneider Altivar 320 variable-speed drive.
//!
//! The drive exchanges a 12-byte input record and a 6-byte output record
//! every tick (see [`pdo`]).  Commands are written from any thread through
//! [`Atv320::set_control_word`], [`Atv320::set_frequency`] and
//! [`Atv320::set_digital_outputs`]; the cycle picks up the latest complete
//! command with one atomic load.
//!
//! The drive publishes no slots: its control surface is the command API.

pub mod pdo;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use termbus_middleware::RegistryClient;
use termbus_types::{BusError, CycleError, DeviceIdentity};
use tokio::runtime::Handle;
use tracing::info;

use crate::device::Device;
pub use pdo::{ControlWord, DeciAmpere, DeciHertz, InputPdo, OutputPdo, StatusWord};

/// Number of drive digital outputs addressable through `set_output`.
pub const DIGITAL_OUTPUTS: usize = 16;

/// Packed command: control word in bits 0..16, frequency in 16..32,
/// digital outputs in 32..48.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Command(u64);

impl Command {
    fn unpack(self) -> OutputPdo {
        OutputPdo {
            control_word: ControlWord(self.0 as u16),
            frequency: DeciHertz((self.0 >> 16) as u16 as i16),
            digital_outputs: (self.0 >> 32) as u16,
        }
    }

    fn with_field(self, shift: u32, value: u16) -> Self {
        let mask = 0xFFFF_u64 << shift;
        Self((self.0 & !mask) | (u64::from(value) << shift))
    }
}

const CONTROL_SHIFT: u32 = 0;
const FREQUENCY_SHIFT: u32 = 16;
const OUTPUTS_SHIFT: u32 = 32;

/// ATV320 drive driver.
#[derive(Debug)]
pub struct Atv320 {
    identity: DeviceIdentity,
    command: AtomicU64,
    last_input: InputPdo,
    faulted: bool,
}

impl Atv320 {
    /// Construct the drive after checking its record layouts.
    ///
    /// # Errors
    ///
    /// [`BusError::PdoSizeMismatch`] when a record does not match its
    /// declared wire size.
    pub fn new(slave_index: u16) -> Result<Self, BusError> {
        Self::with_identity(<Self as Device>::identify(slave_index))
    }

    fn with_identity(identity: DeviceIdentity) -> Result<Self, BusError> {
        pdo::check_layout()?;
        info!(%identity, "drive constructed");
        Ok(Self {
            identity,
            command: AtomicU64::new(0),
            last_input: InputPdo::default(),
            faulted: false,
        })
    }

    /// Replace the control word; frequency and digital outputs are kept.
    pub fn set_control_word(&self, word: ControlWord) {
        self.update(CONTROL_SHIFT, word.0);
    }

    /// Replace the frequency reference, in 0.1 Hz.
    pub fn set_frequency(&self, frequency: DeciHertz) {
        self.update(FREQUENCY_SHIFT, frequency.0 as u16);
    }

    /// Replace all 16 digital outputs at once, bit 0 first.
    pub fn set_digital_outputs(&self, outputs: u16) {
        self.update(OUTPUTS_SHIFT, outputs);
    }

    /// The output record the next cycle will write.
    pub fn command(&self) -> OutputPdo {
        Command(self.command.load(Ordering::Acquire)).unpack()
    }

    /// Input record decoded on the most recent successful cycle.
    pub fn last_input(&self) -> InputPdo {
        self.last_input
    }

    fn update(&self, shift: u32, value: u16) {
        // The closure never returns None, so the update always lands.
        let _ = self
            .command
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                Some(Command(raw).with_field(shift, value).0)
            });
    }

}

// ────────────────────────────────────────────────────────────────────────────
// Device
// ────────────────────────────────────────────────────────────────────────────

impl Device for Atv320 {
    const VENDOR_ID: u32 = 0x0800_005a;
    const PRODUCT_CODE: u32 = 0x389;
    const NAME: &'static str = "ATV320";
    const INPUT_SIZE: usize = pdo::INPUT_PDO_SIZE;

    type OutputPdo = [u8; pdo::OUTPUT_PDO_SIZE];

    fn bind_as<C: RegistryClient>(_handle: &Handle, _client: &Arc<C>, identity: DeviceIdentity) -> Result<Self, BusError> {
        Self::with_identity(identity)
    }

    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Sets digital output `position` of the drive, keeping the others.
    fn set_output(&self, position: usize, value: bool) -> Result<(), BusError> {
        if position >= DIGITAL_OUTPUTS {
            return Err(BusError::OutOfRange {
                position,
                channel_count: DIGITAL_OUTPUTS,
            });
        }
        let bit = 1_u64 << (OUTPUTS_SHIFT as usize + position);
        if value {
            self.command.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.command.fetch_and(!bit, Ordering::AcqRel);
        }
        Ok(())
    }

    fn pdo_cycle(&mut self, input: &[u8], output: &mut Self::OutputPdo) -> Result<(), CycleError> {
        if self.faulted {
            *output = [0; pdo::OUTPUT_PDO_SIZE];
            return Err(CycleError::Faulted);
        }
        match InputPdo::decode(input) {
            Ok(decoded) => self.last_input = decoded,
            Err(err) => {
                self.latch_fault();
                *output = [0; pdo::OUTPUT_PDO_SIZE];
                return Err(err);
            }
        }
        *output = self.command().encode();
        Ok(())
    }

    fn is_faulted(&self) -> bool {
        self.faulted
    }

    fn latch_fault(&mut self) {
        self.faulted = true;
    }
}
