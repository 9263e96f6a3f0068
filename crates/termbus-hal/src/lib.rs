//! `termbus-hal` – device drivers for the fieldbus master.
//!
//! Sits between the cyclic bus driver and the signal fabric: values arrive
//! asynchronously through channel bindings and leave every tick as packed
//! process data.
//!
//! # Modules
//!
//! - [`output_states`] – lock-free per-channel bit vector shared by bindings
//!   and the cycle.
//! - [`binding`] – one registry slot per logical channel, with health
//!   reporting and a teardown gate.
//! - [`device`] – the statically dispatched [`Device`] contract and its
//!   object-safe [`DynDevice`] view.
//! - [`terminal`] – compile-time terminal layouts and the pin bit order.
//! - [`el2xxx`] – the EL2xxx digital output terminal family.
//! - [`atv320`] – ATV320 drive PDO codec and device.
//! - [`catalog`] – `(vendor_id, product_code)` to driver table used by the
//!   binder.

pub mod atv320;
pub mod binding;
pub mod catalog;
pub mod device;
pub mod el2xxx;
pub mod output_states;
pub mod terminal;

pub use atv320::Atv320;
pub use binding::{ChannelBinding, Gate};
pub use catalog::DeviceCatalog;
pub use device::{Device, DynDevice, ProcessImage};
pub use el2xxx::{El2004, El2008, El2794, El2809, El2xxx};
pub use output_states::OutputStates;
pub use terminal::TerminalSpec;
