//! [`DeviceCatalog`] – the binder's identity-to-driver table.
//!
//! The external bus scanner reports each slave's `(vendor_id, product_code)`.
//! The catalog resolves that pair to a driver type and constructs it behind
//! a `Box<dyn DynDevice>`; this is the only place a device is type-erased.
//! Unknown identities leave the slave unbound.

use std::collections::HashMap;
use std::sync::Arc;

use termbus_middleware::RegistryClient;
use termbus_types::{BusError, DeviceIdentity};
use tokio::runtime::Handle;
use tracing::{info, warn};

use crate::atv320::Atv320;
use crate::device::{Device, DynDevice};
use crate::el2xxx::{El2004, El2008, El2794, El2809};

type Constructor<C> = fn(&Handle, &Arc<C>, u16, Option<&str>) -> Result<Box<dyn DynDevice>, BusError>;

struct Entry<C> {
    name: &'static str,
    construct: Constructor<C>,
}

fn construct<D: Device, C: RegistryClient>(
    handle: &Handle,
    client: &Arc<C>,
    slave_index: u16,
    instance: Option<&str>,
) -> Result<Box<dyn DynDevice>, BusError> {
    let identity = match instance {
        Some(instance) => D::identify(slave_index).with_instance(instance),
        None => D::identify(slave_index),
    };
    let device = D::bind_as(handle, client, identity)?;
    Ok(Box::new(device))
}

/// Driver table keyed by hardware identity.
pub struct DeviceCatalog<C: RegistryClient> {
    entries: HashMap<(u32, u32), Entry<C>>,
}

impl<C: RegistryClient> DeviceCatalog<C> {
    /// An empty catalog.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// A catalog holding every driver this crate ships.
    pub fn with_builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register::<El2794>();
        catalog.register::<El2004>();
        catalog.register::<El2008>();
        catalog.register::<El2809>();
        catalog.register::<Atv320>();
        catalog
    }

    /// Add driver `D`.  A driver already registered for the same identity is
    /// replaced.
    pub fn register<D: Device>(&mut self) {
        let previous = self.entries.insert(
            (D::VENDOR_ID, D::PRODUCT_CODE),
            Entry {
                name: D::NAME,
                construct: construct::<D, C>,
            },
        );
        if let Some(previous) = previous {
            warn!(replaced = previous.name, device = D::NAME, "catalog entry replaced");
        }
    }

    /// `true` when a driver is registered for the identity.
    pub fn contains(&self, vendor_id: u32, product_code: u32) -> bool {
        self.entries.contains_key(&(vendor_id, product_code))
    }

    /// Names of the registered drivers, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.entries.values().map(|e| e.name).collect();
        names.sort_unstable();
        names
    }

    /// Construct the driver for the slave at `slave_index`.
    ///
    /// Returns `Ok(None)` when no driver matches the identity.
    ///
    /// # Errors
    ///
    /// Whatever the driver's constructor refuses with, or
    /// [`BusError::IdentityMismatch`] when the constructed device reports a
    /// different identity than the one it was selected for.
    pub fn bind(
        &self,
        handle: &Handle,
        client: &Arc<C>,
        vendor_id: u32,
        product_code: u32,
        slave_index: u16,
    ) -> Result<Option<Box<dyn DynDevice>>, BusError> {
        self.bind_named(handle, client, vendor_id, product_code, slave_index, None)
    }

    /// [`DeviceCatalog::bind`], naming the device's slots after `instance`
    /// when one is given.
    pub fn bind_named(
        &self,
        handle: &Handle,
        client: &Arc<C>,
        vendor_id: u32,
        product_code: u32,
        slave_index: u16,
        instance: Option<&str>,
    ) -> Result<Option<Box<dyn DynDevice>>, BusError> {
        let Some(entry) = self.entries.get(&(vendor_id, product_code)) else {
            warn!(
                slave_index,
                vendor_id = format_args!("{vendor_id:#x}"),
                product_code = format_args!("{product_code:#x}"),
                "no driver for slave; leaving it unbound"
            );
            return Ok(None);
        };

        let device = (entry.construct)(handle, client, slave_index, instance)?;
        check_identity(device.identity(), vendor_id, product_code)?;
        info!(slave_index, device = entry.name, instance, "slave bound");
        Ok(Some(device))
    }
}

impl<C: RegistryClient> Default for DeviceCatalog<C> {
    fn default() -> Self {
        Self::new()
    }
}

fn check_identity(identity: &DeviceIdentity, vendor_id: u32, product_code: u32) -> Result<(), BusError> {
    if identity.matches(vendor_id, product_code) {
        Ok(())
    } else {
        Err(BusError::IdentityMismatch {
            slave_index: identity.slave_index,
            expected_vendor: vendor_id,
            expected_product: product_code,
            vendor_id: identity.vendor_id,
            product_code: identity.product_code,
        })
    }
}
