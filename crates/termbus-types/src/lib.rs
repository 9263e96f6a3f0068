//! `termbus-types` – shared vocabulary for the terminal driver layer.
//!
//! Identity of bus slaves, per-channel health, slot/signal metadata and the
//! two error families: [`BusError`] for configuration and async paths, and
//! the allocation-free [`CycleError`] returned from the cyclic hot path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Identity of one bus slave instance.
///
/// `vendor_id` and `product_code` are compile-time constants of the driver
/// type; the external binder uses them to match hardware to a driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub vendor_id: u32,
    pub product_code: u32,
    /// Terminal type name, e.g. `"EL2008"`.
    pub name: String,
    /// Position on the fieldbus assigned by the topology scan.
    pub slave_index: u16,
    /// Operator-chosen instance name.  When set it replaces `name` as the
    /// prefix of every channel slot name, so two terminals of one type can
    /// share a bus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl DeviceIdentity {
    /// `true` when `(vendor_id, product_code)` is the lookup key of this identity.
    pub fn matches(&self, vendor_id: u32, product_code: u32) -> bool {
        self.vendor_id == vendor_id && self.product_code == product_code
    }

    /// Same identity, addressed by `instance` instead of the type name.
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Prefix of this device's slot names: the instance name if any,
    /// otherwise the type name.
    pub fn channel_prefix(&self) -> &str {
        self.instance.as_deref().unwrap_or(&self.name)
    }

    /// Stable slot name of a physical pin on this device: `"{prefix}.{pin}"`.
    pub fn channel_name(&self, pin: usize) -> String {
        format!("{}.{pin}", self.channel_prefix())
    }
}

impl std::fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.slave_index)?;
        if let Some(instance) = &self.instance {
            write!(f, " \"{instance}\"")?;
        }
        write!(f, " (vendor {:#x}, product {:#x})", self.vendor_id, self.product_code)
    }
}

/// Health of a single channel binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ChannelHealth {
    /// Registration requested, no answer from the registry yet.
    Pending,
    /// Slot registered; values are being applied.
    Bound,
    /// The registry refused the slot.  The channel stays at its default
    /// while the binding retries.
    RegistrationFailed { reason: String },
    /// The registry went away after registration.  Last value is retained.
    Stalled,
}

impl ChannelHealth {
    /// Only [`ChannelHealth::Bound`] counts as healthy.
    pub fn is_healthy(&self) -> bool {
        matches!(self, ChannelHealth::Bound)
    }
}

/// Health transition of one channel, fanned out to the device owner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub slave_index: u16,
    /// Logical channel position (index into the terminal's entries table).
    pub channel: usize,
    /// Slot name, e.g. `"EL2008.5"`.
    pub slot: String,
    pub health: ChannelHealth,
}

impl HealthEvent {
    pub fn new(slave_index: u16, channel: usize, slot: impl Into<String>, health: ChannelHealth) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            slave_index,
            channel,
            slot: slot.into(),
            health,
        }
    }
}

/// Whether an endpoint owns information (signal) or receives it (slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Signal,
    Slot,
}

/// Value type carried by an endpoint.  Terminal channels only carry booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Bool,
}

/// Metadata published alongside every registered endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub name: String,
    pub direction: Direction,
    pub value_type: ValueType,
    pub description: String,
}

impl SlotInfo {
    /// Metadata of an inbound endpoint.
    pub fn slot(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Slot,
            value_type: ValueType::Bool,
            description: description.into(),
        }
    }

    pub fn signal(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Signal,
            value_type: ValueType::Bool,
            description: description.into(),
        }
    }
}

/// Errors raised outside the cyclic hot path: device bring-up, registry
/// traffic, direct output writes and configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BusError {
    #[error("Output position {position} out of range for {channel_count}-channel terminal")]
    OutOfRange { position: usize, channel_count: usize },

    #[error("PDO record {record} is {actual} bytes, vendor layout requires {expected}")]
    PdoSizeMismatch {
        record: String,
        expected: usize,
        actual: usize,
    },

    #[error(
        "Identity mismatch on slave {slave_index}: expected {expected_vendor:#x}/{expected_product:#x}, found {vendor_id:#x}/{product_code:#x}"
    )]
    IdentityMismatch {
        slave_index: u16,
        expected_vendor: u32,
        expected_product: u32,
        vendor_id: u32,
        product_code: u32,
    },

    #[error("Name already registered: {0}")]
    NameTaken(String),

    #[error("Signal registry is unavailable")]
    RegistryUnavailable,

    #[error("Unknown signal: {0}")]
    UnknownSignal(String),

    #[error("Unknown slot: {0}")]
    UnknownSlot(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Device on slave {slave_index} is faulted")]
    DeviceFaulted { slave_index: u16 },
}

/// Errors returned from `pdo_cycle`.
///
/// `Copy` and allocation-free so the cycle path can report them without
/// touching the heap.  Every variant is fatal for the device instance.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleError {
    #[error("Input process data is {actual} bytes, device declares {expected}")]
    InputSizeMismatch { expected: usize, actual: usize },

    #[error("Output process data is {actual} bytes, device declares {expected}")]
    OutputSizeMismatch { expected: usize, actual: usize },

    #[error("Device is faulted and no longer exchanges process data")]
    Faulted,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn el2008(slave_index: u16) -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: 0x2,
            product_code: 0x07d8_3052,
            name: "EL2008".to_string(),
            slave_index,
            instance: None,
        }
    }

    #[test]
    fn channel_name_uses_device_name_and_pin() {
        assert_eq!(el2008(3).channel_name(5), "EL2008.5");
    }

    #[test]
    fn instance_name_replaces_type_name_in_slots() {
        let id = el2008(3).with_instance("conveyor_io");
        assert_eq!(id.channel_prefix(), "conveyor_io");
        assert_eq!(id.channel_name(5), "conveyor_io.5");
        assert_eq!(id.name, "EL2008");
        assert!(id.to_string().contains("EL2008@3 \"conveyor_io\""));
    }

    #[test]
    fn identity_without_instance_deserializes() {
        let id: DeviceIdentity = serde_json::from_str(
            r#"{"vendor_id":2,"product_code":1,"name":"EL2004","slave_index":1}"#,
        )
        .unwrap();
        assert_eq!(id.instance, None);
        assert_eq!(id.channel_name(1), "EL2004.1");
    }

    #[test]
    fn identity_matches_vendor_and_product() {
        let id = el2008(1);
        assert!(id.matches(0x2, 0x07d8_3052));
        assert!(!id.matches(0x2, 0x07d4_3052));
        assert!(!id.matches(0x3, 0x07d8_3052));
    }

    #[test]
    fn identity_display_is_readable() {
        let text = el2008(3).to_string();
        assert!(text.contains("EL2008@3"));
        assert!(text.contains("0x7d83052"));
    }

    #[test]
    fn channel_health_serializes_tagged() {
        let json = serde_json::to_string(&ChannelHealth::RegistrationFailed {
            reason: "taken".to_string(),
        })
        .unwrap();
        assert!(json.contains("registration_failed"));
        let back: ChannelHealth = serde_json::from_str(&json).unwrap();
        assert!(!back.is_healthy());
        assert!(ChannelHealth::Bound.is_healthy());
    }

    #[test]
    fn health_event_carries_slot() {
        let event = HealthEvent::new(3, 2, "EL2008.2", ChannelHealth::Stalled);
        let json = serde_json::to_string(&event).unwrap();
        let back: HealthEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, event.id);
        assert_eq!(back.slot, "EL2008.2");
        assert_eq!(back.health, ChannelHealth::Stalled);
    }

    #[test]
    fn bus_error_display() {
        let err = BusError::OutOfRange {
            position: 8,
            channel_count: 8,
        };
        assert!(err.to_string().contains("out of range"));

        let err = BusError::PdoSizeMismatch {
            record: "input".to_string(),
            expected: 12,
            actual: 14,
        };
        assert!(err.to_string().contains("12"));
    }

    #[test]
    fn cycle_error_is_copy() {
        let err = CycleError::InputSizeMismatch { expected: 12, actual: 0 };
        let copy = err;
        assert_eq!(err, copy);
        assert!(copy.to_string().contains("12"));
    }
}
