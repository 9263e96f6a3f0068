//! `termbus-runtime` – drives the device layer on a cycle.
//!
//! A stand-in for the cyclic bus driver that a real fieldbus master would
//! provide: it lays out the process images, ticks every mounted device and
//! quarantines devices whose cycle fails.
//!
//! # Modules
//!
//! - [`config`] – [`CycleConfig`][config::CycleConfig]: tick period, bus
//!   topology and signal wiring, parsed from TOML.
//! - [`cycle`] – [`CycleRunner`][cycle::CycleRunner]: process-image layout
//!   and the per-tick loop.
//! - [`bringup`] – [`bring_up`][bringup::bring_up]: resolves configured
//!   slaves through the device catalog and applies the wiring.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]: global
//!   `tracing` subscriber with optional OTLP span export.

pub mod bringup;
pub mod config;
pub mod cycle;
pub mod telemetry;

pub use bringup::{BringUp, bring_up};
pub use config::{CycleConfig, SlaveConfig, WiringConfig};
pub use cycle::{CycleRunner, CycleStats};
pub use telemetry::{TracerProviderGuard, init_tracing};
