//! Process data records of the Schneider ATV320 drive.
//!
//! Field order, widths and signedness follow the drive's default PDO
//! mapping.  Words are little-endian on the wire and the records are packed:
//! the input record is exactly [`INPUT_PDO_SIZE`] bytes and the output
//! record exactly [`OUTPUT_PDO_SIZE`].  Both sizes are asserted at compile
//! time and again by [`check_layout`] when a drive is brought up.
//!
//! Scaled quantities stay integers end to end, so a value read from the wire
//! and written back is bit-identical.

use std::fmt;

use termbus_types::{BusError, CycleError};
use zerocopy::byteorder::little_endian::{I16, U16};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Vendor-declared size of the drive's input (TxPDO) record.
pub const INPUT_PDO_SIZE: usize = 12;
/// Vendor-declared size of the drive's output (RxPDO) record.
pub const OUTPUT_PDO_SIZE: usize = 6;

/// Drive status word (CiA 402 `0x6041`).  Opaque to this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StatusWord(pub u16);

/// Drive control word (CiA 402 `0x6040`).  Opaque to this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ControlWord(pub u16);

/// Signed frequency in tenths of a hertz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DeciHertz(pub i16);

impl DeciHertz {
    pub const ZERO: Self = Self(0);

    /// `hz` whole hertz, or `None` if it does not fit the field.
    pub fn from_hertz(hz: i16) -> Option<Self> {
        hz.checked_mul(10).map(Self)
    }

    /// Raw value in tenths of a hertz.
    pub fn tenths(self) -> i16 {
        self.0
    }

    /// Whole hertz, truncated toward zero.
    pub fn whole_hertz(self) -> i16 {
        self.0 / 10
    }
}

impl fmt::Display for DeciHertz {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let raw = i32::from(self.0);
        let sign = if raw < 0 { "-" } else { "" };
        write!(f, "{sign}{}.{} Hz", raw.abs() / 10, raw.abs() % 10)
    }
}

/// Unsigned current in tenths of an ampere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DeciAmpere(pub u16);

impl fmt::Display for DeciAmpere {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} A", self.0 / 10, self.0 % 10)
    }
}

/// Input record, drive to master, exchanged every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputPdo {
    pub status_word: StatusWord,
    pub frequency: DeciHertz,
    pub current: DeciAmpere,
    pub digital_inputs: u16,
    pub analog_input: i16,
    pub drive_state: u16,
}

/// Output record, master to drive, exchanged every cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputPdo {
    pub control_word: ControlWord,
    pub frequency: DeciHertz,
    pub digital_outputs: u16,
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
struct RawInput {
    status_word: U16,
    frequency: I16,
    current: U16,
    digital_inputs: U16,
    analog_input: I16,
    drive_state: U16,
}

#[repr(C)]
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
struct RawOutput {
    control_word: U16,
    frequency: I16,
    digital_outputs: U16,
}

const _: () = assert!(size_of::<RawInput>() == INPUT_PDO_SIZE);
const _: () = assert!(size_of::<RawOutput>() == OUTPUT_PDO_SIZE);

impl InputPdo {
    /// Decode a wire record.  `bytes` must be exactly [`INPUT_PDO_SIZE`] long.
    pub fn decode(bytes: &[u8]) -> Result<Self, CycleError> {
        let raw = RawInput::ref_from_bytes(bytes).map_err(|_| CycleError::InputSizeMismatch {
            expected: INPUT_PDO_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self {
            status_word: StatusWord(raw.status_word.get()),
            frequency: DeciHertz(raw.frequency.get()),
            current: DeciAmpere(raw.current.get()),
            digital_inputs: raw.digital_inputs.get(),
            analog_input: raw.analog_input.get(),
            drive_state: raw.drive_state.get(),
        })
    }

    pub fn encode(&self) -> [u8; INPUT_PDO_SIZE] {
        let raw = RawInput {
            status_word: U16::new(self.status_word.0),
            frequency: I16::new(self.frequency.0),
            current: U16::new(self.current.0),
            digital_inputs: U16::new(self.digital_inputs),
            analog_input: I16::new(self.analog_input),
            drive_state: U16::new(self.drive_state),
        };
        let mut bytes = [0u8; INPUT_PDO_SIZE];
        bytes.copy_from_slice(raw.as_bytes());
        bytes
    }
}

impl OutputPdo {
    /// Decode a wire record.  `bytes` must be exactly [`OUTPUT_PDO_SIZE`] long.
    pub fn decode(bytes: &[u8]) -> Result<Self, CycleError> {
        let raw = RawOutput::ref_from_bytes(bytes).map_err(|_| CycleError::OutputSizeMismatch {
            expected: OUTPUT_PDO_SIZE,
            actual: bytes.len(),
        })?;
        Ok(Self {
            control_word: ControlWord(raw.control_word.get()),
            frequency: DeciHertz(raw.frequency.get()),
            digital_outputs: raw.digital_outputs.get(),
        })
    }

    pub fn encode(&self) -> [u8; OUTPUT_PDO_SIZE] {
        let raw = RawOutput {
            control_word: U16::new(self.control_word.0),
            frequency: I16::new(self.frequency.0),
            digital_outputs: U16::new(self.digital_outputs),
        };
        let mut bytes = [0u8; OUTPUT_PDO_SIZE];
        bytes.copy_from_slice(raw.as_bytes());
        bytes
    }
}

/// Bring-up check of the record layouts against the vendor sizes.
///
/// # Errors
///
/// [`BusError::PdoSizeMismatch`] naming the first record that is off.
pub fn check_layout() -> Result<(), BusError> {
    check_record("atv320 input", size_of::<RawInput>(), INPUT_PDO_SIZE)?;
    check_record("atv320 output", size_of::<RawOutput>(), OUTPUT_PDO_SIZE)
}

fn check_record(record: &str, actual: usize, expected: usize) -> Result<(), BusError> {
    if actual == expected {
        Ok(())
    } else {
        Err(BusError::PdoSizeMismatch {
            record: record.to_string(),
            expected,
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn layout_matches_vendor_sizes() {
        assert_eq!(check_layout(), Ok(()));
    }

    #[test]
    fn size_mismatch_is_reported() {
        assert_eq!(
            check_record("input", 14, 12),
            Err(BusError::PdoSizeMismatch {
                record: "input".to_string(),
                expected: 12,
                actual: 14
            })
        );
    }

    #[test]
    fn input_fields_are_little_endian_in_order() {
        let bytes = [
            0x37, 0x06, // status word 0x0637
            0xF4, 0x01, // 50.0 Hz
            0x2A, 0x00, // 4.2 A
            0x05, 0x00, // DI1 | DI3
            0xFF, 0xFF, // analog -1
            0x03, 0x00, // drive state
        ];
        let input = InputPdo::decode(&bytes).unwrap();
        assert_eq!(input.status_word, StatusWord(0x0637));
        assert_eq!(input.frequency, DeciHertz(500));
        assert_eq!(input.current, DeciAmpere(42));
        assert_eq!(input.digital_inputs, 0b101);
        assert_eq!(input.analog_input, -1);
        assert_eq!(input.drive_state, 3);
        assert_eq!(input.encode(), bytes);
    }

    #[test]
    fn output_encodes_negative_frequency() {
        let output = OutputPdo {
            control_word: ControlWord(0x000F),
            frequency: DeciHertz(-125),
            digital_outputs: 0x0002,
        };
        assert_eq!(output.encode(), [0x0F, 0x00, 0x83, 0xFF, 0x02, 0x00]);
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert_eq!(
            InputPdo::decode(&[0; 11]),
            Err(CycleError::InputSizeMismatch {
                expected: 12,
                actual: 11
            })
        );
        assert_eq!(
            OutputPdo::decode(&[0; 7]),
            Err(CycleError::OutputSizeMismatch {
                expected: 6,
                actual: 7
            })
        );
    }

    #[test]
    fn frequency_display_uses_integer_tenths() {
        assert_eq!(DeciHertz(500).to_string(), "50.0 Hz");
        assert_eq!(DeciHertz(-125).to_string(), "-12.5 Hz");
        assert_eq!(DeciHertz(-5).to_string(), "-0.5 Hz");
        assert_eq!(DeciHertz(i16::MIN).to_string(), "-3276.8 Hz");
        assert_eq!(DeciAmpere(42).to_string(), "4.2 A");
    }

    #[test]
    fn frequency_from_hertz_checks_range() {
        assert_eq!(DeciHertz::from_hertz(50), Some(DeciHertz(500)));
        assert_eq!(DeciHertz::from_hertz(-3276), Some(DeciHertz(-32760)));
        assert_eq!(DeciHertz::from_hertz(3277), None);
        assert_eq!(DeciHertz(-125).whole_hertz(), -12);
        assert_eq!(DeciHertz(-125).tenths(), -125);
    }

    proptest! {
        #[test]
        fn output_record_is_six_bytes_and_lossless(
            control in any::<u16>(),
            frequency in any::<i16>(),
            outputs in any::<u16>(),
        ) {
            let record = OutputPdo {
                control_word: ControlWord(control),
                frequency: DeciHertz(frequency),
                digital_outputs: outputs,
            };
            let bytes = record.encode();
            prop_assert_eq!(bytes.len(), OUTPUT_PDO_SIZE);
            prop_assert_eq!(OutputPdo::decode(&bytes).unwrap(), record);
        }

        #[test]
        fn any_input_record_round_trips(bytes in any::<[u8; INPUT_PDO_SIZE]>()) {
            let input = InputPdo::decode(&bytes).unwrap();
            prop_assert_eq!(input.encode(), bytes);
            prop_assert_eq!(InputPdo::decode(&input.encode()).unwrap(), input);
        }
    }
}
