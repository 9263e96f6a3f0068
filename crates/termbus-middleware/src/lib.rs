//! `termbus-middleware` – the signal/slot fabric seam.
//!
//! Carries boolean values between publishers anywhere in the process and
//! the physical channels of terminal devices, without caring about their
//! meaning.
//!
//! # Modules
//!
//! - [`client`] – [`RegistryClient`], the trait every device is handed at
//!   construction, and [`SlotReceiver`], the per-slot delivery stream.
//! - [`registry`] – [`SignalRegistry`], an in-process registry that owns
//!   signal and slot names and wires them together by configuration.

pub mod client;
pub mod registry;

pub use client::{RegistryClient, SlotReceiver, SlotRelease};
pub use registry::{Signal, SignalRegistry};
