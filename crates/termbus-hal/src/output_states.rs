//! [`OutputStates`] – commanded channel bits shared between the async and
//! cycle contexts.
//!
//! One bit per logical channel, held in a single `AtomicU32`.  Writers set
//! or clear their own bit with `fetch_or` / `fetch_and`, so concurrent
//! writes to different channels never lose each other.  The cycle reads all
//! bits with one load.  There is no cross-bit snapshot guarantee between
//! writers: two channels updated within the same tick may be seen in any
//! old/new combination.

use std::sync::atomic::{AtomicU32, Ordering};

use termbus_types::BusError;

/// Largest channel count a single state word can carry.
pub const MAX_CHANNELS: usize = u32::BITS as usize;

/// Lock-free bit vector of commanded output states.
#[derive(Debug)]
pub struct OutputStates {
    bits: AtomicU32,
    len: usize,
}

impl OutputStates {
    /// Create a vector of `len` channels, all `false`.
    pub fn new(len: usize) -> Result<Self, BusError> {
        if len > MAX_CHANNELS {
            return Err(BusError::Config(format!(
                "{len} channels exceed the {MAX_CHANNELS}-bit state word"
            )));
        }
        Ok(Self {
            bits: AtomicU32::new(0),
            len,
        })
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always `false`; construction refuses zero channels.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set logical channel `position` to `value`.
    ///
    /// # Errors
    ///
    /// [`BusError::OutOfRange`] when `position >= len`.
    pub fn set(&self, position: usize, value: bool) -> Result<(), BusError> {
        if position >= self.len {
            return Err(BusError::OutOfRange {
                position,
                channel_count: self.len,
            });
        }
        let mask = 1u32 << position;
        if value {
            self.bits.fetch_or(mask, Ordering::Release);
        } else {
            self.bits.fetch_and(!mask, Ordering::Release);
        }
        Ok(())
    }

    /// Current value of logical channel `position`.
    pub fn get(&self, position: usize) -> Result<bool, BusError> {
        if position >= self.len {
            return Err(BusError::OutOfRange {
                position,
                channel_count: self.len,
            });
        }
        Ok(self.snapshot() & (1 << position) != 0)
    }

    /// All channel bits, bit `i` = logical channel `i`.
    pub fn snapshot(&self) -> u32 {
        self.bits.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn starts_all_false() {
        let states = OutputStates::new(8).unwrap();
        assert_eq!(states.len(), 8);
        assert_eq!(states.snapshot(), 0);
        assert!(!states.get(7).unwrap());
    }

    #[test]
    fn set_and_clear_single_bit() {
        let states = OutputStates::new(4).unwrap();
        states.set(2, true).unwrap();
        assert_eq!(states.snapshot(), 0b0100);
        states.set(2, false).unwrap();
        assert_eq!(states.snapshot(), 0);
    }

    #[test]
    fn out_of_range_is_rejected() {
        let states = OutputStates::new(16).unwrap();
        assert_eq!(
            states.set(16, true),
            Err(BusError::OutOfRange {
                position: 16,
                channel_count: 16
            })
        );
        assert!(states.get(16).is_err());
        assert_eq!(states.snapshot(), 0);
    }

    #[test]
    fn oversized_vector_is_a_config_error() {
        assert!(matches!(OutputStates::new(33), Err(BusError::Config(_))));
        assert!(OutputStates::new(MAX_CHANNELS).is_ok());
    }

    #[test]
    fn concurrent_writers_do_not_clobber_each_other() {
        let states = Arc::new(OutputStates::new(16).unwrap());
        let handles: Vec<_> = (0..16)
            .map(|position| {
                let states = Arc::clone(&states);
                thread::spawn(move || {
                    for i in 0..1_000 {
                        states.set(position, i % 2 == 0).unwrap();
                    }
                    // Final value for this channel: odd channels end high.
                    states.set(position, position % 2 == 1).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(states.snapshot(), 0b1010_1010_1010_1010);
    }
}
