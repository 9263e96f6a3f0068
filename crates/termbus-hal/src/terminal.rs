//! Compile-time configuration of digital output terminals.
//!
//! A [`TerminalSpec`] names a terminal type, its identity constants and the
//! `ENTRIES` table mapping each logical channel to the vendor's physical pin
//! number.  The table is the authoritative bit order on the wire: logical
//! position is never assumed to equal the pin.
//!
//! Pin `p` (1-based) occupies bit `p - 1` of the output frame, least
//! significant bit first: byte `(p - 1) / 8`, bit `(p - 1) % 8`.

use crate::device::ProcessImage;

/// Vendor id shared by the Beckhoff terminal family.
pub const BECKHOFF_VENDOR_ID: u32 = 0x2;

/// Output frame length of an `channels`-channel terminal.
///
/// The `/ 9 + 1` form is the family's wire contract and is kept literally.
pub const fn frame_len(channels: usize) -> usize {
    channels / 9 + 1
}

/// Static description of one terminal type.
pub trait TerminalSpec: Send + Sync + 'static {
    const NAME: &'static str;
    const VENDOR_ID: u32 = BECKHOFF_VENDOR_ID;
    const PRODUCT_CODE: u32;
    /// Number of logical channels: 4, 8 or 16.
    const SIZE: usize;
    /// Physical pin of each logical channel.
    const ENTRIES: &'static [usize];

    /// Output frame, `frame_len(SIZE)` bytes.
    type Frame: ProcessImage;

    /// Evaluated when a device of this type is constructed; a bad table is
    /// a build error, not a runtime one.
    const LAYOUT: () = {
        assert!(
            Self::SIZE == 4 || Self::SIZE == 8 || Self::SIZE == 16,
            "terminal size must be 4, 8 or 16"
        );
        assert!(Self::ENTRIES.len() == Self::SIZE, "entries must list one pin per channel");
        assert!(
            <Self::Frame as ProcessImage>::LEN == frame_len(Self::SIZE),
            "frame length must be SIZE / 9 + 1"
        );
        let bits = <Self::Frame as ProcessImage>::LEN * 8;
        let mut i = 0;
        while i < Self::SIZE {
            let pin = Self::ENTRIES[i];
            assert!(pin >= 1 && pin <= bits, "pin does not fit the output frame");
            let mut j = i + 1;
            while j < Self::SIZE {
                assert!(Self::ENTRIES[j] != pin, "pins must be unique");
                j += 1;
            }
            i += 1;
        }
    };
}

/// Serialise logical channel bits into a fresh frame.
///
/// Instantiating this for a spec with a bad table fails the build:
///
/// ```compile_fail
/// use termbus_hal::terminal::{TerminalSpec, encode_frame, frame_len};
///
/// struct ThreePins;
///
/// impl TerminalSpec for ThreePins {
///     const NAME: &'static str = "EL0003";
///     const PRODUCT_CODE: u32 = 0x1;
///     const SIZE: usize = 4;
///     const ENTRIES: &'static [usize] = &[1, 2, 3];
///     type Frame = [u8; frame_len(4)];
/// }
///
/// let _ = encode_frame::<ThreePins>(0b1);
/// ```
pub fn encode_frame<S: TerminalSpec>(states: u32) -> S::Frame {
    let () = S::LAYOUT;
    let mut frame = <S::Frame as Default>::default();
    let bytes = frame.as_mut();
    for (position, &pin) in S::ENTRIES.iter().enumerate() {
        if states & (1 << position) != 0 {
            let bit = pin - 1;
            bytes[bit / 8] |= 1 << (bit % 8);
        }
    }
    frame
}

/// Recover logical channel bits from a frame.
pub fn decode_frame<S: TerminalSpec>(frame: &S::Frame) -> u32 {
    let () = S::LAYOUT;
    let bytes = frame.as_ref();
    S::ENTRIES
        .iter()
        .enumerate()
        .filter(|&(_, &pin)| bytes[(pin - 1) / 8] & (1 << ((pin - 1) % 8)) != 0)
        .fold(0, |states, (position, _)| states | 1 << position)
}

// ────────────────────────────────────────────────────────────────────────────
// Terminal types
// ────────────────────────────────────────────────────────────────────────────

/// EL2794: 4-channel digital output, 24 V DC, 2 A.
#[derive(Debug, Clone, Copy)]
pub struct El2794Spec;

impl TerminalSpec for El2794Spec {
    const NAME: &'static str = "EL2794";
    const PRODUCT_CODE: u32 = 0x0aea_3052;
    const SIZE: usize = 4;
    const ENTRIES: &'static [usize] = &[1, 5, 4, 8];
    type Frame = [u8; frame_len(4)];
}

/// EL2004: 4-channel digital output, 24 V DC, 0.5 A.
#[derive(Debug, Clone, Copy)]
pub struct El2004Spec;

impl TerminalSpec for El2004Spec {
    const NAME: &'static str = "EL2004";
    const PRODUCT_CODE: u32 = 0x07d4_3052;
    const SIZE: usize = 4;
    const ENTRIES: &'static [usize] = &[1, 5, 4, 8];
    type Frame = [u8; frame_len(4)];
}

/// EL2008: 8-channel digital output, 24 V DC, 0.5 A.
#[derive(Debug, Clone, Copy)]
pub struct El2008Spec;

impl TerminalSpec for El2008Spec {
    const NAME: &'static str = "EL2008";
    const PRODUCT_CODE: u32 = 0x07d8_3052;
    const SIZE: usize = 8;
    const ENTRIES: &'static [usize] = &[1, 5, 2, 6, 3, 7, 4, 8];
    type Frame = [u8; frame_len(8)];
}

/// EL2809: 16-channel digital output, 24 V DC, 0.5 A.
#[derive(Debug, Clone, Copy)]
pub struct El2809Spec;

impl TerminalSpec for El2809Spec {
    const NAME: &'static str = "EL2809";
    const PRODUCT_CODE: u32 = 0x0af9_3052;
    const SIZE: usize = 16;
    const ENTRIES: &'static [usize] = &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16];
    type Frame = [u8; frame_len(16)];
}
