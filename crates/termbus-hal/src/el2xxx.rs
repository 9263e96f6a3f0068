//! [`El2xxx`] – the Beckhoff EL2xxx digital output terminal family.
//!
//! One generic driver, specialised at compile time by a [`TerminalSpec`].
//! Construction allocates one [`ChannelBinding`] per channel, each claiming
//! the slot `"{prefix}.{pin}"`, where the prefix is the terminal's instance
//! name if it was given one ([`El2xxx::named`]) and its type name otherwise.  The cycle reads the shared [`OutputStates`]
//! with a single atomic load and writes the frame in pin order.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use termbus_hal::device::Device;
//! use termbus_hal::el2xxx::El2008;
//! use termbus_middleware::SignalRegistry;
//! use tokio::runtime::Handle;
//!
//! # async fn demo() -> Result<(), termbus_types::BusError> {
//! let registry = Arc::new(SignalRegistry::new());
//! let mut device = El2008::new(&Handle::current(), &registry, 3)?;
//!
//! device.set_output(2, true)?;
//! let mut frame = [0u8; 1];
//! device.pdo_cycle(&[], &mut frame).expect("output terminal takes no input");
//! assert_eq!(frame, [0b0000_0010]);
//! # Ok(())
//! # }
//! ```

use std::marker::PhantomData;
use std::sync::Arc;

use termbus_middleware::RegistryClient;
use termbus_types::{BusError, ChannelHealth, CycleError, DeviceIdentity, HealthEvent, SlotInfo};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tracing::{info, instrument};

use crate::binding::{BindingContext, ChannelBinding, Gate};
use crate::device::Device;
use crate::output_states::OutputStates;
use crate::terminal::{El2004Spec, El2008Spec, El2794Spec, El2809Spec, TerminalSpec, decode_frame, encode_frame};

/// Capacity of the per-device health event channel.
const HEALTH_EVENT_CAPACITY: usize = 64;

pub type El2794 = El2xxx<El2794Spec>;
pub type El2004 = El2xxx<El2004Spec>;
pub type El2008 = El2xxx<El2008Spec>;
pub type El2809 = El2xxx<El2809Spec>;

/// Digital output terminal driver, specialised by `S`.
pub struct El2xxx<S: TerminalSpec> {
    identity: DeviceIdentity,
    states: Arc<OutputStates>,
    bindings: Vec<ChannelBinding>,
    gate: Arc<Gate>,
    events: broadcast::Sender<HealthEvent>,
    faulted: bool,
    _spec: PhantomData<S>,
}

impl<S: TerminalSpec> El2xxx<S> {
    /// Construct the device and issue one slot registration per channel.
    ///
    /// Returns before any registration completes; every channel reads
    /// `false` until its first delivered value.
    pub fn new<C: RegistryClient>(handle: &Handle, client: &Arc<C>, slave_index: u16) -> Result<Self, BusError> {
        Self::with_identity(handle, client, <Self as Device>::identify(slave_index))
    }

    /// Like [`El2xxx::new`], with slots named `"{instance}.{pin}"` so two
    /// terminals of this type can share one registry.
    pub fn named<C: RegistryClient>(
        handle: &Handle,
        client: &Arc<C>,
        slave_index: u16,
        instance: impl Into<String>,
    ) -> Result<Self, BusError> {
        let identity = <Self as Device>::identify(slave_index).with_instance(instance);
        Self::with_identity(handle, client, identity)
    }

    #[instrument(skip(handle, client), fields(device = S::NAME))]
    fn with_identity<C: RegistryClient>(
        handle: &Handle,
        client: &Arc<C>,
        identity: DeviceIdentity,
    ) -> Result<Self, BusError> {
        let () = S::LAYOUT;

        let slave_index = identity.slave_index;
        let states = Arc::new(OutputStates::new(S::SIZE)?);
        let gate = Arc::new(Gate::new());
        let (events, _) = broadcast::channel(HEALTH_EVENT_CAPACITY);
        let ctx = BindingContext {
            slave_index,
            states: Arc::clone(&states),
            gate: Arc::clone(&gate),
            events: events.clone(),
        };

        let bindings = S::ENTRIES
            .iter()
            .enumerate()
            .map(|(position, &pin)| {
                let info = SlotInfo::slot(
                    identity.channel_name(pin),
                    format!("{} output pin {pin} on slave {slave_index}", S::NAME),
                );
                ChannelBinding::spawn(handle, Arc::downgrade(client), info, position, ctx.clone())
            })
            .collect();

        info!(%identity, channels = S::SIZE, "terminal constructed");
        Ok(Self {
            identity,
            states,
            bindings,
            gate,
            events,
            faulted: false,
            _spec: PhantomData,
        })
    }

    /// Number of logical channels, `S::SIZE`.
    pub fn channel_count(&self) -> usize {
        S::SIZE
    }

    /// Current commanded value of logical channel `position`.
    pub fn output(&self, position: usize) -> Result<bool, BusError> {
        self.states.get(position)
    }

    /// Bindings in logical channel order.
    pub fn bindings(&self) -> &[ChannelBinding] {
        &self.bindings
    }

    /// Binding of logical channel `position`.
    ///
    /// # Errors
    ///
    /// [`BusError::OutOfRange`] past the last channel.
    pub fn binding(&self, position: usize) -> Result<&ChannelBinding, BusError> {
        self.bindings.get(position).ok_or(BusError::OutOfRange {
            position,
            channel_count: S::SIZE,
        })
    }

    /// Health of logical channel `position`.
    pub fn channel_health(&self, position: usize) -> Result<ChannelHealth, BusError> {
        self.binding(position).map(ChannelBinding::health)
    }

    /// Recover logical channel bits from a frame produced by this terminal.
    pub fn decode_frame(frame: &S::Frame) -> u32 {
        decode_frame::<S>(frame)
    }
}

impl<S: TerminalSpec> Device for El2xxx<S> {
    const VENDOR_ID: u32 = S::VENDOR_ID;
    const PRODUCT_CODE: u32 = S::PRODUCT_CODE;
    const NAME: &'static str = S::NAME;
    const INPUT_SIZE: usize = 0;

    type OutputPdo = S::Frame;

    fn bind_as<C: RegistryClient>(handle: &Handle, client: &Arc<C>, identity: DeviceIdentity) -> Result<Self, BusError> {
        Self::with_identity(handle, client, identity)
    }

    fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn set_output(&self, position: usize, value: bool) -> Result<(), BusError> {
        self.states.set(position, value)
    }

    fn pdo_cycle(&mut self, input: &[u8], output: &mut S::Frame) -> Result<(), CycleError> {
        if self.faulted {
            *output = <S::Frame as Default>::default();
            return Err(CycleError::Faulted);
        }
        if input.len() != Self::INPUT_SIZE {
            self.faulted = true;
            *output = <S::Frame as Default>::default();
            return Err(CycleError::InputSizeMismatch {
                expected: Self::INPUT_SIZE,
                actual: input.len(),
            });
        }
        *output = encode_frame::<S>(self.states.snapshot());
        Ok(())
    }

    fn is_faulted(&self) -> bool {
        self.faulted
    }

    fn latch_fault(&mut self) {
        self.faulted = true;
    }

    fn health_watchers(&self) -> Vec<watch::Receiver<ChannelHealth>> {
        self.bindings.iter().map(ChannelBinding::health_receiver).collect()
    }

    fn subscribe_health(&self) -> Option<broadcast::Receiver<HealthEvent>> {
        Some(self.events.subscribe())
    }
}

impl<S: TerminalSpec> Drop for El2xxx<S> {
    fn drop(&mut self) {
        // Bindings abort their tasks when the fields drop right after this.
        self.gate.close();
    }
}

impl<S: TerminalSpec> std::fmt::Debug for El2xxx<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("El2xxx")
            .field("identity", &self.identity)
            .field("states", &format_args!("{:#06b}", self.states.snapshot()))
            .field("bindings", &self.bindings)
            .field("faulted", &self.faulted)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use termbus_middleware::SignalRegistry;

    async fn settled(device: &impl Device) {
        for mut rx in device.health_watchers() {
            tokio::time::timeout(Duration::from_secs(1), rx.wait_for(|h| *h != ChannelHealth::Pending))
                .await
                .expect("channel never left Pending")
                .expect("health sender dropped");
        }
    }

    #[tokio::test]
    async fn construction_yields_one_binding_per_channel() {
        let registry = Arc::new(SignalRegistry::new());
        let d4 = El2004::new(&Handle::current(), &registry, 1).unwrap();
        let d8 = El2008::new(&Handle::current(), &registry, 2).unwrap();
        let d16 = El2809::new(&Handle::current(), &registry, 3).unwrap();
        assert_eq!(d4.bindings().len(), 4);
        assert_eq!(d8.bindings().len(), 8);
        assert_eq!(d16.bindings().len(), 16);
        assert_eq!(d16.channel_count(), 16);
    }

    #[tokio::test]
    async fn slots_are_named_after_device_and_pin() {
        let registry = Arc::new(SignalRegistry::new());
        let device = El2794::new(&Handle::current(), &registry, 4).unwrap();
        let slots: Vec<&str> = device.bindings().iter().map(ChannelBinding::slot).collect();
        assert_eq!(slots, ["EL2794.1", "EL2794.5", "EL2794.4", "EL2794.8"]);

        settled(&device).await;
        let registered: Vec<String> = registry.slots().into_iter().map(|s| s.name).collect();
        assert_eq!(registered, ["EL2794.1", "EL2794.4", "EL2794.5", "EL2794.8"]);
    }

    #[tokio::test]
    async fn channels_default_to_false() {
        let registry = Arc::new(SignalRegistry::new());
        let mut device = El2008::new(&Handle::current(), &registry, 3).unwrap();
        for position in 0..8 {
            assert!(!device.output(position).unwrap());
        }
        let mut frame = [0xFF];
        device.pdo_cycle(&[], &mut frame).unwrap();
        assert_eq!(frame, [0]);
    }

    #[tokio::test]
    async fn el2008_scenario_sets_physical_pin_two() {
        let registry = Arc::new(SignalRegistry::new());
        let mut device = El2008::new(&Handle::current(), &registry, 3).unwrap();
        assert_eq!(device.identity().slave_index, 3);

        device.set_output(2, true).unwrap();
        let mut frame = [0u8; 1];
        device.pdo_cycle(&[], &mut frame).unwrap();
        assert_eq!(frame, [0b0000_0010]);
        assert_eq!(El2008::decode_frame(&frame), 1 << 2);
    }

    #[tokio::test]
    async fn set_output_past_last_channel_is_out_of_range() {
        let registry = Arc::new(SignalRegistry::new());
        let d4 = El2004::new(&Handle::current(), &registry, 1).unwrap();
        let d8 = El2008::new(&Handle::current(), &registry, 2).unwrap();
        let d16 = El2809::new(&Handle::current(), &registry, 3).unwrap();
        assert_eq!(
            d4.set_output(4, true),
            Err(BusError::OutOfRange {
                position: 4,
                channel_count: 4
            })
        );
        assert!(matches!(d8.set_output(8, true), Err(BusError::OutOfRange { .. })));
        assert!(matches!(d16.set_output(16, true), Err(BusError::OutOfRange { .. })));
        assert!(d16.channel_health(16).is_err());
    }

    #[tokio::test]
    async fn consecutive_cycles_are_identical() {
        let registry = Arc::new(SignalRegistry::new());
        let mut device = El2809::new(&Handle::current(), &registry, 5).unwrap();
        device.set_output(0, true).unwrap();
        device.set_output(9, true).unwrap();

        let mut first = [0u8; 2];
        let mut second = [0u8; 2];
        device.pdo_cycle(&[], &mut first).unwrap();
        device.pdo_cycle(&[], &mut second).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, [0x01, 0x02]);
    }

    #[tokio::test]
    async fn unexpected_input_faults_the_device() {
        let registry = Arc::new(SignalRegistry::new());
        let mut device = El2004::new(&Handle::current(), &registry, 1).unwrap();
        device.set_output(0, true).unwrap();

        let mut frame = [0u8; 1];
        assert_eq!(
            device.pdo_cycle(&[0x00], &mut frame),
            Err(CycleError::InputSizeMismatch {
                expected: 0,
                actual: 1
            })
        );
        assert!(device.is_faulted());
        assert_eq!(frame, [0]);

        // Stays faulted even with a well-formed call.
        assert_eq!(device.pdo_cycle(&[], &mut frame), Err(CycleError::Faulted));
        assert_eq!(frame, [0]);
    }

    #[tokio::test]
    async fn delivered_signal_drives_channel() {
        let registry = Arc::new(SignalRegistry::new());
        let mut device = El2008::new(&Handle::current(), &registry, 3).unwrap();
        settled(&device).await;

        let signal = registry.register_signal(SlotInfo::signal("conveyor.run", "test")).unwrap();
        registry.connect("EL2008.6", "conveyor.run").unwrap();
        signal.send(true).unwrap();

        // Pin 6 is logical channel 3.
        let binding = device.binding(3).unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while binding.deliveries() < 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let mut frame = [0u8; 1];
        device.pdo_cycle(&[], &mut frame).unwrap();
        assert_eq!(frame, [0b0010_0000]);
    }

    #[tokio::test]
    async fn duplicate_name_fails_only_that_channel() {
        let registry = Arc::new(SignalRegistry::new());
        let _squatter = registry
            .register_slot(SlotInfo::slot("EL2004.5", "taken first"))
            .await
            .unwrap();

        let device = El2004::new(&Handle::current(), &registry, 1).unwrap();
        let mut events = device.subscribe_health().unwrap();
        settled(&device).await;

        assert!(matches!(
            device.channel_health(1).unwrap(),
            ChannelHealth::RegistrationFailed { .. }
        ));
        assert_eq!(device.channel_health(0).unwrap(), ChannelHealth::Bound);
        assert!(!device.output(1).unwrap());

        let failed = loop {
            let event = events.recv().await.unwrap();
            if !event.health.is_healthy() {
                break event;
            }
        };
        assert_eq!(failed.slot, "EL2004.5");
        assert_eq!(failed.channel, 1);
    }

    #[tokio::test]
    async fn channel_binds_once_its_name_is_freed() {
        let registry = Arc::new(SignalRegistry::new());
        let squatter = registry
            .register_slot(SlotInfo::slot("EL2004.5", "taken first"))
            .await
            .unwrap();

        let mut device = El2004::new(&Handle::current(), &registry, 1).unwrap();
        let mut events = device.subscribe_health().unwrap();
        settled(&device).await;
        assert!(matches!(
            device.channel_health(1).unwrap(),
            ChannelHealth::RegistrationFailed { .. }
        ));

        drop(squatter);
        let mut rx = device.binding(1).unwrap().health_receiver();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(ChannelHealth::is_healthy))
            .await
            .expect("channel never bound after the name was freed")
            .unwrap();

        // Failure then recovery both reach the device's event stream.
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if event.channel == 1 {
                seen.push(event.health);
            }
        }
        assert!(matches!(seen.first(), Some(ChannelHealth::RegistrationFailed { .. })));
        assert_eq!(seen.last(), Some(&ChannelHealth::Bound));

        // Wiring now reaches the recovered channel.
        let signal = registry.register_signal(SlotInfo::signal("lamp", "test")).unwrap();
        registry.connect("EL2004.5", "lamp").unwrap();
        signal.send(true).unwrap();
        let binding = device.binding(1).unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while binding.deliveries() < 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        let mut frame = [0u8; 1];
        device.pdo_cycle(&[], &mut frame).unwrap();
        // Channel 1 is pin 5.
        assert_eq!(frame, [0b0001_0000]);
    }

    #[tokio::test]
    async fn named_terminals_of_one_type_share_a_registry() {
        let registry = Arc::new(SignalRegistry::new());
        let left = El2004::named(&Handle::current(), &registry, 1, "left").unwrap();
        let right = El2004::named(&Handle::current(), &registry, 2, "right").unwrap();
        settled(&left).await;
        settled(&right).await;

        assert_eq!(left.binding(0).unwrap().slot(), "left.1");
        assert_eq!(right.binding(3).unwrap().slot(), "right.8");
        assert_eq!(left.identity().name, "EL2004");
        assert!(left.health_watchers().iter().all(|rx| rx.borrow().is_healthy()));
        assert!(right.health_watchers().iter().all(|rx| rx.borrow().is_healthy()));
        assert_eq!(registry.slots().len(), 8);
    }

    #[tokio::test]
    async fn dropping_device_releases_slots() {
        let registry = Arc::new(SignalRegistry::new());
        let device = El2004::new(&Handle::current(), &registry, 1).unwrap();
        settled(&device).await;
        assert_eq!(registry.slots().len(), 4);

        drop(device);
        tokio::time::timeout(Duration::from_secs(1), async {
            while !registry.slots().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("slots were not released");

        let again = El2004::new(&Handle::current(), &registry, 1).unwrap();
        settled(&again).await;
        assert!(again.health_watchers().iter().all(|rx| rx.borrow().is_healthy()));
    }
}
