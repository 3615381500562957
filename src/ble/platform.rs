//! btleplug-backed transport.
//!
//! Selection scans for a while and hands the matching peripherals to a
//! [`PeripheralChooser`]. Link loss is picked up from the adapter's
//! `DeviceDisconnected` events and notifications are pumped from the
//! peripheral's notification stream, both by spawned tasks that live as long
//! as the connection.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{
    CharacteristicHandle, CharacteristicRole, ConnectionHandle, ConnectionId, EventSink,
    PeripheralFilter, PeripheralHandle, ServiceRef, Transport, TransportEvent,
};
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::utils::hex_preview;

/// A peripheral seen during a selection scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralCandidate {
    /// Handle returned if this candidate is chosen.
    pub handle: PeripheralHandle,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Advertised services.
    pub services: Vec<Uuid>,
}

/// Picks one peripheral out of the scan results.
///
/// Returning `None` dismisses the selection.
pub trait PeripheralChooser: Send + Sync {
    /// Index of the chosen candidate.
    fn choose(&self, candidates: &[PeripheralCandidate]) -> Option<usize>;
}

impl<F> PeripheralChooser for F
where
    F: Fn(&[PeripheralCandidate]) -> Option<usize> + Send + Sync,
{
    fn choose(&self, candidates: &[PeripheralCandidate]) -> Option<usize> {
        self(candidates)
    }
}

/// Chooses the candidate with the strongest signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrongestSignal;

impl PeripheralChooser for StrongestSignal {
    fn choose(&self, candidates: &[PeripheralCandidate]) -> Option<usize> {
        candidates
            .iter()
            .enumerate()
            .max_by_key(|(_, c)| c.rssi.unwrap_or(i16::MIN))
            .map(|(index, _)| index)
    }
}

struct Link<P = Peripheral> {
    peripheral: P,
    disconnect_sink: Option<EventSink>,
    tasks: Vec<JoinHandle<()>>,
}

impl<P> Link<P> {
    fn new(peripheral: P, tasks: Vec<JoinHandle<()>>) -> Self {
        Self {
            peripheral,
            disconnect_sink: None,
            tasks,
        }
    }
}

impl<P> Drop for Link<P> {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

type Links<P = Peripheral> = Arc<Mutex<HashMap<ConnectionId, Link<P>>>>;

/// Report link loss for `connection`, at most once, and forget the link.
///
/// Without a registered sink nothing is emitted here; a later registration
/// finds the link gone and reports immediately.
fn report_link_down<P>(links: &Links<P>, connection: ConnectionId) {
    let link = links.lock().remove(&connection);
    let Some(mut link) = link else { return };

    match link.disconnect_sink.take() {
        Some(sink) => {
            debug!("Reporting link loss on {}", connection);
            sink.emit(TransportEvent::Disconnected { connection });
        }
        None => debug!("Link {} closed before a disconnect sink was registered", connection),
    }
}

/// [`Transport`] over the first Bluetooth adapter of the host.
pub struct BtleplugTransport {
    adapter: Adapter,
    config: TransportConfig,
    chooser: Box<dyn PeripheralChooser>,
    /// Peripherals seen by the last selection scan.
    candidates: RwLock<HashMap<String, Peripheral>>,
    links: Links,
}

impl BtleplugTransport {
    /// Create a transport on the first available adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BluetoothUnavailable`] if there is no adapter.
    pub async fn new(config: TransportConfig) -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter, config))
    }

    /// Create a transport on a specific adapter.
    pub fn with_adapter(adapter: Adapter, config: TransportConfig) -> Self {
        Self {
            adapter,
            config,
            chooser: Box::new(StrongestSignal),
            candidates: RwLock::new(HashMap::new()),
            links: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Replace the peripheral chooser.
    pub fn with_chooser(mut self, chooser: impl PeripheralChooser + 'static) -> Self {
        self.chooser = Box::new(chooser);
        self
    }

    /// The transport configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn scan(&self, filter: &PeripheralFilter) -> Result<Vec<Peripheral>> {
        let scan_filter = ScanFilter {
            services: filter.service().into_iter().collect(),
        };

        debug!("Scanning for {:?}", self.config.scan_duration);
        self.adapter.start_scan(scan_filter).await?;
        tokio::time::sleep(self.config.scan_duration).await;

        let found = self.adapter.peripherals().await;
        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        Ok(found?)
    }

    fn peripheral(&self, connection: ConnectionId) -> Result<Peripheral> {
        match self.links.lock().get(&connection) {
            Some(link) => Ok(link.peripheral.clone()),
            None => Err(Error::UnexpectedDisconnect),
        }
    }

    fn characteristic(
        &self,
        handle: &CharacteristicHandle,
    ) -> Result<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral(handle.connection)?;

        let characteristic = peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == handle.service)
            .flat_map(|s| s.characteristics)
            .find(|c| c.uuid == handle.uuid)
            .ok_or_else(|| Error::CharacteristicNotFound {
                uuid: handle.uuid.to_string(),
            })?;

        Ok((peripheral, characteristic))
    }

    /// Spawn the task reporting `DeviceDisconnected` for `peripheral_id`.
    async fn watch_disconnect(
        &self,
        connection: ConnectionId,
        peripheral_id: PeripheralId,
    ) -> Result<JoinHandle<()>> {
        let mut events = self.adapter.events().await?;
        let links = self.links.clone();

        Ok(tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    if id == peripheral_id {
                        info!("Peripheral {:?} disconnected", id);
                        report_link_down(&links, connection);
                        break;
                    }
                }
            }
            trace!("Disconnect watcher for {} stopped", connection);
        }))
    }
}

fn supports(characteristic: &Characteristic, role: CharacteristicRole) -> bool {
    let properties = characteristic.properties;
    match role {
        CharacteristicRole::Write => properties
            .intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
        CharacteristicRole::Notify => {
            properties.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
        }
        CharacteristicRole::Read => properties.contains(CharPropFlags::READ),
    }
}

fn write_type(characteristic: &Characteristic) -> WriteType {
    if characteristic
        .properties
        .contains(CharPropFlags::WRITE_WITHOUT_RESPONSE)
    {
        WriteType::WithoutResponse
    } else {
        WriteType::WithResponse
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    async fn request_peripheral(&self, filter: &PeripheralFilter) -> Result<PeripheralHandle> {
        let mut candidates = Vec::new();
        let mut seen = HashMap::new();

        for peripheral in self.scan(filter).await? {
            let properties = match peripheral.properties().await {
                Ok(Some(p)) => p,
                _ => continue,
            };

            if !filter.matches(properties.local_name.as_deref(), &properties.services) {
                continue;
            }

            let handle = PeripheralHandle::new(peripheral.id().to_string(), properties.local_name);
            trace!("Candidate {} ({:?} dBm)", handle, properties.rssi);

            seen.insert(handle.id().to_string(), peripheral);
            candidates.push(PeripheralCandidate {
                handle,
                rssi: properties.rssi,
                services: properties.services,
            });
        }

        if candidates.is_empty() {
            return Err(Error::SelectionError {
                reason: format!("no peripheral matching {:?} found", filter),
            });
        }

        let index = self
            .chooser
            .choose(&candidates)
            .ok_or(Error::SelectionCancelled)?;
        let chosen = candidates
            .get(index)
            .ok_or_else(|| Error::SelectionError {
                reason: format!("chooser picked {} of {} candidates", index, candidates.len()),
            })?;

        *self.candidates.write() = seen;

        Ok(chosen.handle.clone())
    }

    async fn connect_gatt(&self, peripheral: &PeripheralHandle) -> Result<ConnectionHandle> {
        let device = self
            .candidates
            .read()
            .get(peripheral.id())
            .cloned()
            .ok_or_else(|| Error::ConnectionFailed {
                reason: format!("{} was not found by the last scan", peripheral),
            })?;

        match tokio::time::timeout(self.config.connect_timeout, device.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(Error::ConnectionFailed {
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(Error::ConnectionFailed {
                    reason: format!("timed out after {:?}", self.config.connect_timeout),
                })
            }
        }

        let connection = ConnectionHandle::new(peripheral.clone());
        let watcher = match self.watch_disconnect(connection.id(), device.id()).await {
            Ok(watcher) => watcher,
            Err(e) => {
                if let Err(close) = device.disconnect().await {
                    warn!("Failed to close {} after watcher setup failed: {}", peripheral, close);
                }
                return Err(e);
            }
        };

        self.links.lock().insert(
            connection.id(),
            Link::new(device, vec![watcher]),
        );

        info!("Connected to {} as {}", peripheral, connection.id());

        Ok(connection)
    }

    async fn resolve_service(&self, connection: &ConnectionHandle, uuid: Uuid) -> Result<ServiceRef> {
        let peripheral = self.peripheral(connection.id())?;

        if let Err(e) = peripheral.discover_services().await {
            warn!("Service discovery on {} failed: {}", connection.id(), e);
            return Err(Error::ServiceNotFound {
                uuid: uuid.to_string(),
            });
        }

        let services = peripheral.services();
        for service in &services {
            debug!(
                "Found service {} with {} characteristics",
                service.uuid,
                service.characteristics.len()
            );
        }

        if services.iter().any(|s| s.uuid == uuid) {
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
        let handle = CharacteristicHandle {
            connection: service.connection,
            service: service.uuid,
            uuid,
            role,
        };

        let (_, characteristic) = self.characteristic(&handle)?;
        debug!(
            "Found characteristic {}, properties: {:?}",
            uuid, characteristic.properties
        );

        if !supports(&characteristic, role) {
            warn!("Characteristic {} does not allow {}", uuid, role);
            return Err(Error::CharacteristicNotFound {
                uuid: uuid.to_string(),
            });
        }

        Ok(handle)
    }

    async fn subscribe(&self, characteristic: &CharacteristicHandle, sink: EventSink) -> Result<()> {
        let (peripheral, target) = self.characteristic(characteristic)?;

        // Open the stream first so nothing sent right after the CCCD write is lost.
        let mut notifications = peripheral.notifications().await?;

        peripheral
            .subscribe(&target)
            .await
            .map_err(|e| Error::SubscriptionFailed {
                reason: e.to_string(),
            })?;
        let connection = characteristic.connection;
        let uuid = characteristic.uuid;

        let listener = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != uuid {
                    continue;
                }
                trace!(
                    "Notification from {}: {}",
                    uuid,
                    hex_preview(&notification.value, 20)
                );
                sink.emit(TransportEvent::Notification {
                    connection,
                    characteristic: uuid,
                    data: Bytes::from(notification.value),
                });
            }
            debug!("Notification listener for {} stopped", uuid);
        });

        match self.links.lock().get_mut(&connection) {
            Some(link) => link.tasks.push(listener),
            None => listener.abort(),
        }

        debug!("Subscribed to notifications from {}", uuid);

        Ok(())
    }

    async fn write(&self, characteristic: &CharacteristicHandle, data: &[u8]) -> Result<()> {
        if data.len() > self.config.max_write_len {
            return Err(Error::WriteFailed {
                reason: format!(
                    "payload of {} bytes exceeds the {} byte limit",
                    data.len(),
                    self.config.max_write_len
                ),
            });
        }

        let (peripheral, target) = self.characteristic(characteristic)?;

        peripheral
            .write(&target, data, write_type(&target))
            .await
            .map_err(|e| Error::WriteFailed {
                reason: e.to_string(),
            })?;

        trace!("Wrote {} bytes to characteristic {}", data.len(), target.uuid);

        Ok(())
    }

    async fn read(&self, characteristic: &CharacteristicHandle) -> Result<Vec<u8>> {
        let (peripheral, target) = self.characteristic(characteristic)?;

        let data = peripheral
            .read(&target)
            .await
            .map_err(|e| Error::ReadFailed {
                reason: e.to_string(),
            })?;

        trace!("Read {} bytes from characteristic {}", data.len(), target.uuid);

        Ok(data)
    }

    fn on_disconnected(&self, connection: &ConnectionHandle, sink: EventSink) {
        let report_now = {
            let mut links = self.links.lock();
            match links.get_mut(&connection.id()) {
                Some(link) => {
                    link.disconnect_sink = Some(sink.clone());
                    false
                }
                None => true,
            }
        };

        if report_now {
            sink.emit(TransportEvent::Disconnected {
                connection: connection.id(),
            });
        }
    }

    async fn disconnect(&self, connection: &ConnectionHandle) -> Result<()> {
        let peripheral = match self.links.lock().get(&connection.id()) {
            Some(link) => link.peripheral.clone(),
            None => return Ok(()),
        };

        info!("Disconnecting {}", connection.id());
        let result = peripheral.disconnect().await;

        // Some platforms never raise DeviceDisconnected for a local disconnect.
        report_link_down(&self.links, connection.id());

        result.map_err(Error::Bluetooth)
    }
}
