//! Bus cycle configuration, parsed from TOML.
//!
//! The topology comes from the external scanner; this file only describes
//! it so the runner can mount the right drivers in the right order.
//!
//! ```toml
//! period_us = 1000
//!
//! [[slaves]]
//! slave_index = 1
//! vendor_id = 0x2
//! product_code = 0x07d83052
//! name = "infeed"           # optional slot prefix, default "EL2008"
//!
//! [[wiring]]
//! signal = "conveyor.run"
//! slot = "infeed.6"
//! ```

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use termbus_types::BusError;

/// Whole-bus configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Tick period in microseconds.
    #[serde(default = "default_period_us")]
    pub period_us: u64,

    /// A tick taking longer than `period * overrun_warn_ratio` is counted
    /// and logged as an overrun.
    #[serde(default = "default_overrun_warn_ratio")]
    pub overrun_warn_ratio: f64,

    /// How long bring-up waits for channel registrations to settle.
    #[serde(default = "default_registration_timeout_ms")]
    pub registration_timeout_ms: u64,

    /// Slaves in bus order.
    #[serde(default)]
    pub slaves: Vec<SlaveConfig>,

    /// Signal to slot connections made once registrations settle.
    #[serde(default)]
    pub wiring: Vec<WiringConfig>,
}

/// One slave as reported by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveConfig {
    pub slave_index: u16,
    pub vendor_id: u32,
    pub product_code: u32,
    /// Slot prefix for this slave.  Defaults to the driver's type name;
    /// set it when two slaves of one type share the bus.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// One signal to slot connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WiringConfig {
    pub signal: String,
    pub slot: String,
}

fn default_period_us() -> u64 {
    1000
}
fn default_overrun_warn_ratio() -> f64 {
    1.0
}
fn default_registration_timeout_ms() -> u64 {
    1000
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            period_us: default_period_us(),
            overrun_warn_ratio: default_overrun_warn_ratio(),
            registration_timeout_ms: default_registration_timeout_ms(),
            slaves: Vec::new(),
            wiring: Vec::new(),
        }
    }
}

impl CycleConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// [`BusError::Config`] for malformed TOML or a document
    /// [`CycleConfig::validate`] rejects.
    pub fn from_toml_str(text: &str) -> Result<Self, BusError> {
        let config: Self = toml::from_str(text).map_err(|e| BusError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges, slave index uniqueness and slave names.
    ///
    /// # Errors
    ///
    /// [`BusError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<(), BusError> {
        if self.period_us == 0 {
            return Err(BusError::Config("period_us must be positive".to_string()));
        }
        if !(self.overrun_warn_ratio.is_finite() && self.overrun_warn_ratio > 0.0) {
            return Err(BusError::Config(
                "overrun_warn_ratio must be a positive number".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        let mut names = HashSet::new();
        for slave in &self.slaves {
            if !seen.insert(slave.slave_index) {
                return Err(BusError::Config(format!(
                    "slave_index {} listed twice",
                    slave.slave_index
                )));
            }
            if let Some(name) = &slave.name {
                if name.is_empty() || name.contains('.') {
                    return Err(BusError::Config(format!(
                        "slave {} name {name:?} must be non-empty and contain no '.'",
                        slave.slave_index
                    )));
                }
                if !names.insert(name.as_str()) {
                    return Err(BusError::Config(format!("slave name {name:?} listed twice")));
                }
            }
        }
        Ok(())
    }

    /// Tick period.
    pub fn period(&self) -> Duration {
        Duration::from_micros(self.period_us)
    }

    /// Tick duration above which a tick counts as an overrun.
    pub fn overrun_threshold(&self) -> Duration {
        let nanos = (self.period_us as f64 * 1000.0 * self.overrun_warn_ratio).round();
        Duration::from_nanos(nanos as u64)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = CycleConfig::from_toml_str("").unwrap();
        assert_eq!(config, CycleConfig::default());
        assert_eq!(config.period(), Duration::from_millis(1));
        assert_eq!(config.overrun_threshold(), Duration::from_millis(1));
    }

    #[test]
    fn parses_topology_and_wiring() {
        let config = CycleConfig::from_toml_str(
            r#"
            period_us = 500
            overrun_warn_ratio = 0.8

            [[slaves]]
            slave_index = 1
            vendor_id = 0x2
            product_code = 0x07d83052

            [[slaves]]
            slave_index = 2
            vendor_id = 0x0800005a
            product_code = 0x389

            [[wiring]]
            signal = "conveyor.run"
            slot = "EL2008.6"
            "#,
        )
        .unwrap();

        assert_eq!(config.period(), Duration::from_micros(500));
        assert_eq!(config.overrun_threshold(), Duration::from_micros(400));
        assert_eq!(config.slaves.len(), 2);
        assert_eq!(
            config.slaves[0],
            SlaveConfig {
                slave_index: 1,
                vendor_id: 0x2,
                product_code: 0x07d8_3052,
                name: None,
            }
        );
        assert_eq!(config.wiring[0].slot, "EL2008.6");
    }

    #[test]
    fn zero_period_is_rejected() {
        assert!(matches!(
            CycleConfig::from_toml_str("period_us = 0"),
            Err(BusError::Config(_))
        ));
    }

    #[test]
    fn duplicate_slave_index_is_rejected() {
        let err = CycleConfig::from_toml_str(
            r#"
            [[slaves]]
            slave_index = 3
            vendor_id = 2
            product_code = 1

            [[slaves]]
            slave_index = 3
            vendor_id = 2
            product_code = 2
            "#,
        )
        .unwrap_err();
        assert_eq!(err, BusError::Config("slave_index 3 listed twice".to_string()));
    }

    #[test]
    fn slave_names_are_parsed_and_checked() {
        let config = CycleConfig::from_toml_str(
            r#"
            [[slaves]]
            slave_index = 1
            vendor_id = 2
            product_code = 0x07d43052
            name = "left"
            "#,
        )
        .unwrap();
        assert_eq!(config.slaves[0].name.as_deref(), Some("left"));

        let twice = r#"
            [[slaves]]
            slave_index = 1
            vendor_id = 2
            product_code = 1
            name = "door"

            [[slaves]]
            slave_index = 2
            vendor_id = 2
            product_code = 1
            name = "door"
        "#;
        assert_eq!(
            CycleConfig::from_toml_str(twice),
            Err(BusError::Config("slave name \"door\" listed twice".to_string()))
        );

        let dotted = r#"
            [[slaves]]
            slave_index = 1
            vendor_id = 2
            product_code = 1
            name = "a.b"
        "#;
        assert!(matches!(CycleConfig::from_toml_str(dotted), Err(BusError::Config(_))));
    }

    #[test]
    fn malformed_toml_is_a_config_error() {
        assert!(matches!(
            CycleConfig::from_toml_str("period_us = \"fast\""),
            Err(BusError::Config(_))
        ));
    }
}
