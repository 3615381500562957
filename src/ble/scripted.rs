//! In-memory transport for driving sessions without a radio.
//!
//! [`ScriptedTransport`] plays a single peripheral whose services and
//! characteristics are declared up front. Failures and link loss can be
//! injected at any step, and any step can be held open so a test can act
//! while a call is in flight.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::profile::ServiceProfile;
use crate::ble::transport::{
    CharacteristicHandle, CharacteristicRole, ConnectionHandle, ConnectionId, EventSink,
    PeripheralFilter, PeripheralHandle, ServiceRef, Transport, TransportEvent,
};
use crate::ble::uuids::ESP32_UART_DEVICE_NAME;
use crate::error::{Error, Result};

/// A transport call, for failure injection and call accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    /// [`Transport::request_peripheral`]
    RequestPeripheral,
    /// [`Transport::connect_gatt`]
    ConnectGatt,
    /// [`Transport::resolve_service`]
    ResolveService,
    /// [`Transport::resolve_characteristic`]
    ResolveCharacteristic,
    /// [`Transport::subscribe`]
    Subscribe,
    /// [`Transport::write`]
    Write,
    /// [`Transport::read`]
    Read,
    /// [`Transport::disconnect`]
    Disconnect,
}

#[derive(Default)]
struct Gate {
    reached: Notify,
    release: Notify,
}

#[derive(Default)]
struct Link {
    open: bool,
    /// A link-down event was delivered or suppressed.
    reported: bool,
    disconnect_sink: Option<EventSink>,
    notify_sinks: Vec<(Uuid, EventSink)>,
}

struct Script {
    peripheral: Option<PeripheralHandle>,
    services: HashMap<Uuid, Vec<Uuid>>,
    values: HashMap<Uuid, Vec<u8>>,
    failures: HashMap<Step, Error>,
    link_drops: HashSet<Step>,
    gates: HashMap<Step, Arc<Gate>>,
    silent_disconnect: bool,
    links: HashMap<ConnectionId, Link>,
    current: Option<ConnectionHandle>,
    calls: Vec<Step>,
    writes: Vec<Bytes>,
    disconnect_calls: usize,
}

/// Scripted single-peripheral [`Transport`].
pub struct ScriptedTransport {
    script: Mutex<Script>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::for_profile(&ServiceProfile::uart())
    }
}

impl ScriptedTransport {
    /// A UART peripheral named `ESP32_BLE_UART`.
    pub fn new() -> Self {
        Self::default()
    }

    /// A peripheral exposing every characteristic `profile` declares.
    pub fn for_profile(profile: &ServiceProfile) -> Self {
        let characteristics = profile
            .required_characteristics()
            .into_iter()
            .map(|(uuid, _)| uuid)
            .collect();

        let mut services = HashMap::new();
        services.insert(profile.service(), characteristics);

        Self {
            script: Mutex::new(Script {
                peripheral: Some(PeripheralHandle::new(
                    "scripted-0",
                    Some(ESP32_UART_DEVICE_NAME.to_string()),
                )),
                services,
                values: HashMap::new(),
                failures: HashMap::new(),
                link_drops: HashSet::new(),
                gates: HashMap::new(),
                silent_disconnect: false,
                links: HashMap::new(),
                current: None,
                calls: Vec::new(),
                writes: Vec::new(),
                disconnect_calls: 0,
            }),
        }
    }

    /// Replace the peripheral the chooser yields; `None` dismisses the chooser.
    pub fn with_peripheral(self, peripheral: Option<PeripheralHandle>) -> Self {
        self.script.lock().peripheral = peripheral;
        self
    }

    /// Remove a service from the peripheral.
    pub fn without_service(self, service: Uuid) -> Self {
        self.script.lock().services.remove(&service);
        self
    }

    /// Remove a characteristic from every service.
    pub fn without_characteristic(self, characteristic: Uuid) -> Self {
        for characteristics in self.script.lock().services.values_mut() {
            characteristics.retain(|uuid| *uuid != characteristic);
        }
        self
    }

    /// Add a readable characteristic with a fixed value.
    pub fn with_value(self, service: Uuid, characteristic: Uuid, value: impl Into<Vec<u8>>) -> Self {
        {
            let mut script = self.script.lock();
            script.services.entry(service).or_default().push(characteristic);
            script.values.insert(characteristic, value.into());
        }
        self
    }

    /// Make `disconnect` close the link without ever reporting it.
    pub fn with_silent_disconnect(self) -> Self {
        self.script.lock().silent_disconnect = true;
        self
    }

    // === Injection ===

    /// Fail the next call of `step` with `error`.
    pub fn fail_at(&self, step: Step, error: Error) {
        self.script.lock().failures.insert(step, error);
    }

    /// Drop the link during the next call of `step`, before it returns.
    ///
    /// For [`Step::ConnectGatt`] the new link is dropped right after it opens,
    /// before anyone can register for its disconnect.
    pub fn disconnect_at(&self, step: Step) {
        self.script.lock().link_drops.insert(step);
    }

    /// Hold the next call of `step` until [`release`](Self::release).
    pub fn hold(&self, step: Step) {
        self.script.lock().gates.insert(step, Arc::new(Gate::default()));
    }

    /// Wait until a held call of `step` is blocked.
    pub async fn reached(&self, step: Step) {
        let gate = self.script.lock().gates.get(&step).cloned();
        if let Some(gate) = gate {
            gate.reached.notified().await;
        }
    }

    /// Let a held call of `step` continue.
    pub fn release(&self, step: Step) {
        if let Some(gate) = self.script.lock().gates.remove(&step) {
            gate.release.notify_one();
        }
    }

    /// Drop the current link as if the peripheral went away.
    pub fn drop_link(&self) {
        let current = self.script.lock().current.as_ref().map(ConnectionHandle::id);
        if let Some(connection) = current {
            self.close(connection, false);
        }
    }

    /// Push a notification on the current link.
    ///
    /// Returns `false` when nothing is subscribed to `characteristic`.
    pub fn notify(&self, characteristic: Uuid, data: impl Into<Bytes>) -> bool {
        let target = {
            let script = self.script.lock();
            script.current.as_ref().and_then(|connection| {
                let link = script.links.get(&connection.id())?;
                if !link.open {
                    return None;
                }
                link.notify_sinks
                    .iter()
                    .find(|(uuid, _)| *uuid == characteristic)
                    .map(|(_, sink)| (connection.id(), sink.clone()))
            })
        };

        match target {
            Some((connection, sink)) => {
                sink.emit(TransportEvent::Notification {
                    connection,
                    characteristic,
                    data: data.into(),
                });
                true
            }
            None => false,
        }
    }

    // === Accounting ===

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<Step> {
        self.script.lock().calls.clone()
    }

    /// Number of calls of `step`.
    pub fn call_count(&self, step: Step) -> usize {
        self.script.lock().calls.iter().filter(|s| **s == step).count()
    }

    /// Payloads written so far.
    pub fn writes(&self) -> Vec<Bytes> {
        self.script.lock().writes.clone()
    }

    /// Number of `disconnect` calls.
    pub fn disconnect_calls(&self) -> usize {
        self.script.lock().disconnect_calls
    }

    /// The most recently opened connection.
    pub fn current_connection(&self) -> Option<ConnectionHandle> {
        self.script.lock().current.clone()
    }

    /// Whether the most recent connection is still open.
    pub fn is_linked(&self) -> bool {
        let script = self.script.lock();
        script
            .current
            .as_ref()
            .and_then(|c| script.links.get(&c.id()))
            .map(|link| link.open)
            .unwrap_or(false)
    }

    // === Internals ===

    /// Bookkeeping shared by every call: record it, wait at its gate, drop
    /// the link if asked to, then hand back an injected failure.
    async fn enter(&self, step: Step) -> Result<()> {
        let gate = {
            let mut script = self.script.lock();
            script.calls.push(step);
            script.gates.get(&step).cloned()
        };
        trace!("Scripted call {:?}", step);

        if let Some(gate) = gate {
            gate.reached.notify_one();
            gate.release.notified().await;
        }

        // A connect drops its own link once it exists.
        if step != Step::ConnectGatt {
            self.drop_link_if_scripted(step);
        }

        match self.script.lock().failures.remove(&step) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn drop_link_if_scripted(&self, step: Step) {
        let drop_link = self.script.lock().link_drops.remove(&step);
        if drop_link {
            debug!("Dropping link during {:?}", step);
            self.drop_link();
        }
    }

    fn ensure_open(&self, connection: ConnectionId) -> Result<()> {
        let script = self.script.lock();
        match script.links.get(&connection) {
            Some(link) if link.open => Ok(()),
            _ => Err(Error::UnexpectedDisconnect),
        }
    }

    /// Close a link, reporting it at most once.
    fn close(&self, connection: ConnectionId, silent: bool) {
        let sink = {
            let mut script = self.script.lock();
            let Some(link) = script.links.get_mut(&connection) else {
                return;
            };
            if !link.open {
                return;
            }
            link.open = false;
            link.notify_sinks.clear();
            if silent {
                link.reported = true;
                None
            } else {
                let sink = link.disconnect_sink.take();
                if sink.is_some() {
                    link.reported = true;
                }
                sink
            }
        };

        if let Some(sink) = sink {
            sink.emit(TransportEvent::Disconnected { connection });
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn request_peripheral(&self, filter: &PeripheralFilter) -> Result<PeripheralHandle> {
        self.enter(Step::RequestPeripheral).await?;

        let script = self.script.lock();
        let peripheral = script.peripheral.clone().ok_or(Error::SelectionCancelled)?;
        let advertised: Vec<Uuid> = script.services.keys().copied().collect();

        if !filter.matches(peripheral.name(), &advertised) {
            return Err(Error::SelectionError {
                reason: format!("no peripheral matches {:?}", filter),
            });
        }
        Ok(peripheral)
    }

    async fn connect_gatt(&self, peripheral: &PeripheralHandle) -> Result<ConnectionHandle> {
        self.enter(Step::ConnectGatt).await?;

        let connection = ConnectionHandle::new(peripheral.clone());
        {
            let mut script = self.script.lock();
            script.links.insert(
                connection.id(),
                Link {
                    open: true,
                    ..Link::default()
                },
            );
            script.current = Some(connection.clone());
        }
        debug!("Scripted connection {} opened", connection.id());

        self.drop_link_if_scripted(Step::ConnectGatt);

        Ok(connection)
    }

    async fn resolve_service(&self, connection: &ConnectionHandle, uuid: Uuid) -> Result<ServiceRef> {
        self.enter(Step::ResolveService).await?;
        self.ensure_open(connection.id())?;

        if self.script.lock().services.contains_key(&uuid) {
            Ok(ServiceRef {
                connection: connection.id(),
                uuid,
            })
        } else {
            Err(Error::ServiceNotFound {
                uuid: uuid.to_string(),
            })
        }
    }

    async fn resolve_characteristic(
        &self,
        service: &ServiceRef,
        uuid: Uuid,
        role: CharacteristicRole,
    ) -> Result<CharacteristicHandle> {
        self.enter(Step::ResolveCharacteristic).await?;
        self.ensure_open(service.connection)?;

        let found = self
            .script
            .lock()
            .services
            .get(&service.uuid)
            .map(|characteristics| characteristics.contains(&uuid))
            .unwrap_or(false);

        if found {
            Ok(CharacteristicHandle {
                connection: service.connection,
                service: service.uuid,
                uuid,
                role,
            })
        } else {
            Err(Error::CharacteristicNotFound {
                uuid: uuid.to_string(),
            })
        }
    }

    async fn subscribe(&self, characteristic: &CharacteristicHandle, sink: EventSink) -> Result<()> {
        self.enter(Step::Subscribe).await?;
        self.ensure_open(characteristic.connection)?;

        if let Some(link) = self.script.lock().links.get_mut(&characteristic.connection) {
            link.notify_sinks.push((characteristic.uuid, sink));
        }
        Ok(())
    }

    async fn write(&self, characteristic: &CharacteristicHandle, data: &[u8]) -> Result<()> {
        self.ensure_open(characteristic.connection)
            .map_err(|_| Error::WriteFailed {
                reason: "link closed".to_string(),
            })?;
        self.enter(Step::Write).await?;

        self.script.lock().writes.push(Bytes::copy_from_slice(data));
        Ok(())
    }

    async fn read(&self, characteristic: &CharacteristicHandle) -> Result<Vec<u8>> {
        self.enter(Step::Read).await?;
        self.ensure_open(characteristic.connection)?;

        self.script
            .lock()
            .values
            .get(&characteristic.uuid)
            .cloned()
            .ok_or_else(|| Error::ReadFailed {
                reason: format!("characteristic {} is not readable", characteristic.uuid),
            })
    }

    fn on_disconnected(&self, connection: &ConnectionHandle, sink: EventSink) {
        let report_now = {
            let mut script = self.script.lock();
            let Some(link) = script.links.get_mut(&connection.id()) else {
                return;
            };
            if link.open {
                link.disconnect_sink = Some(sink.clone());
                false
            } else if !link.reported {
                link.reported = true;
                true
            } else {
                false
            }
        };

        if report_now {
            sink.emit(TransportEvent::Disconnected {
                connection: connection.id(),
            });
        }
    }

    async fn disconnect(&self, connection: &ConnectionHandle) -> Result<()> {
        self.script.lock().disconnect_calls += 1;
        self.enter(Step::Disconnect).await?;

        let silent = self.script.lock().silent_disconnect;
        self.close(connection.id(), silent);
        Ok(())
    }
}
