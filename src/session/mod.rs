//! BLE session lifecycle management.
//!
//! A [`Session`] takes a connect request through peripheral selection, GATT
//! connection, service and characteristic resolution and notification
//! subscription, then serves sends until the link goes away.
//!
//! Every connect attempt gets a generation number. A disconnect event, a user
//! disconnect and every pipeline step that commits a transition compare
//! against it under the session lock, so a step that resumes after the link
//! was lost finds itself superseded and throws its result away.

pub mod events;
pub mod frame;
pub mod log;
pub mod state;

#[cfg(test)]
mod tests;

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::characteristics::{CharacteristicChannel, CharacteristicHandles};
use crate::ble::profile::ServiceProfile;
use crate::ble::transport::{ConnectionHandle, EventSink, PeripheralHandle, Transport, TransportEvent};
use crate::ble::uuids::*;
use crate::config::SessionConfig;
use crate::error::{Error, Result};

pub use events::{CallbackHandle, Notice, NoticeLevel, SessionEvent};
pub use frame::Frame;
pub use log::{DisconnectReason, LogEntry, LogEntryKind, Marker, SessionLog};
pub use state::SessionState;

/// Mutable session state. Only touched with the lock held, never across an await.
struct Inner<T: Transport> {
    state: SessionState,
    /// Generation of the current connect attempt.
    attempt: u64,
    /// Attempt ended by a user disconnect rather than link loss.
    cancelled_attempt: Option<u64>,
    peripheral: Option<PeripheralHandle>,
    connection: Option<ConnectionHandle>,
    /// Channel resolved but not yet subscribed.
    pending: Option<CharacteristicChannel<T>>,
    /// Channel of a ready session.
    channel: Option<CharacteristicChannel<T>>,
    log: SessionLog,
}

impl<T: Transport> Inner<T> {
    fn is_current(&self, attempt: u64) -> bool {
        self.attempt == attempt
    }

    /// Error returned to a step of `attempt` that was superseded.
    fn preemption_error(&self, attempt: u64) -> Error {
        if self.cancelled_attempt == Some(attempt) {
            Error::Cancelled
        } else {
            Error::UnexpectedDisconnect
        }
    }

    fn device_name(&self) -> Option<String> {
        self.peripheral
            .as_ref()
            .map(|p| p.display_name().to_string())
    }
}

struct Shared<T: Transport> {
    transport: Arc<T>,
    config: SessionConfig,
    inner: Mutex<Inner<T>>,
    event_tx: broadcast::Sender<SessionEvent>,
    callback_counter: AtomicU64,
}

/// A single BLE session bound to one [`ServiceProfile`].
///
/// Cloning yields another handle to the same session.
pub struct Session<T: Transport + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport + 'static> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Transport + 'static> Session<T> {
    /// Create a disconnected session driving `transport`.
    pub fn new(transport: Arc<T>, config: SessionConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);

        let log = match config.log_capacity {
            Some(capacity) => SessionLog::with_capacity(capacity),
            None => SessionLog::new(),
        };

        Self {
            shared: Arc::new(Shared {
                transport,
                config,
                inner: Mutex::new(Inner {
                    state: SessionState::Disconnected,
                    attempt: 0,
                    cancelled_attempt: None,
                    peripheral: None,
                    connection: None,
                    pending: None,
                    channel: None,
                    log,
                }),
                event_tx,
                callback_counter: AtomicU64::new(0),
            }),
        }
    }

    // === Observable state ===

    /// Get the current state.
    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    /// Check if the session accepts sends.
    pub fn is_ready(&self) -> bool {
        self.state().is_ready()
    }

    /// Display name of the selected peripheral.
    pub fn device_name(&self) -> Option<String> {
        self.shared.inner.lock().device_name()
    }

    /// The selected peripheral.
    pub fn peripheral(&self) -> Option<PeripheralHandle> {
        self.shared.inner.lock().peripheral.clone()
    }

    /// Characteristic handles of a ready session.
    pub fn handles(&self) -> Option<CharacteristicHandles> {
        self.shared
            .inner
            .lock()
            .channel
            .as_ref()
            .map(|c| c.handles().clone())
    }

    /// The bound profile.
    pub fn profile(&self) -> &ServiceProfile {
        &self.shared.config.profile
    }

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Snapshot of the session log.
    pub fn log(&self) -> SessionLog {
        self.shared.inner.lock().log.clone()
    }

    /// Remove every log entry.
    pub fn clear_log(&self) {
        self.shared.inner.lock().log.clear();
        debug!("Session log cleared");
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.event_tx.subscribe()
    }

    // === Commands ===

    /// Run the connect pipeline.
    ///
    /// Returns the selected peripheral once the session is ready.
    ///
    /// # Errors
    ///
    /// [`Error::SessionAlreadyActive`] if the session is not disconnected;
    /// otherwise the error of the failed step, [`Error::UnexpectedDisconnect`]
    /// if the link dropped mid-way, or [`Error::Cancelled`] if
    /// [`disconnect`](Self::disconnect) was called mid-way.
    pub async fn connect(&self) -> Result<PeripheralHandle> {
        let attempt = self.shared.begin_attempt()?;

        match self.shared.run_pipeline(attempt).await {
            Ok(peripheral) => Ok(peripheral),
            Err(e) => Err(self.shared.fail_attempt(attempt, e)),
        }
    }

    /// Disconnect from the peripheral.
    ///
    /// A ready session waits (up to the configured timeout) for the link-down
    /// event before reporting `Disconnected`. A running connect attempt is
    /// cancelled. Does nothing when already disconnected or disconnecting.
    pub async fn disconnect(&self) -> Result<()> {
        let shared = &self.shared;

        let (connection, mut events) = {
            let mut inner = shared.inner.lock();

            if !inner.state.is_connecting() && !inner.state.is_ready() {
                debug!("Disconnect ignored in state {}", inner.state);
                return Ok(());
            }

            inner.cancelled_attempt = Some(inner.attempt);

            let Some(connection) = inner.connection.clone() else {
                info!("Cancelling connection attempt in state {}", inner.state);
                shared.reset(&mut inner, DisconnectReason::Cancelled);
                shared.notify(Notice::info("Connection attempt cancelled"));
                return Ok(());
            };

            // Supersede whatever is in flight; the link-down event finishes the job.
            inner.attempt += 1;
            inner.pending = None;
            inner.channel = None;
            let events = shared.event_tx.subscribe();
            shared.transition(&mut inner, SessionState::Disconnecting);
            (connection, events)
        };

        info!("Disconnecting from {}", connection.peripheral());

        let result = shared.transport.disconnect(&connection).await;

        let observed = match &result {
            Ok(()) => tokio::time::timeout(
                shared.config.disconnect_timeout,
                shared.wait_until_released(&connection, &mut events),
            )
            .await
            .is_ok(),
            Err(e) => {
                warn!("Disconnect request failed: {}", e);
                false
            }
        };

        if !observed {
            let mut inner = shared.inner.lock();
            if inner.connection.as_ref().map(ConnectionHandle::id) == Some(connection.id()) {
                warn!(
                    "No link-down event for {}; marking session disconnected",
                    connection.id()
                );
                let name = inner.device_name().unwrap_or_default();
                shared.reset(&mut inner, DisconnectReason::UserRequested);
                drop(inner);
                shared.notify(Notice::info(format!("Disconnected from {}", name)));
            }
        }

        result
    }

    /// Send a payload to the peripheral.
    ///
    /// # Errors
    ///
    /// [`Error::NotReady`] outside `Ready` or without a write characteristic
    /// (no transport call is made),
    /// [`Error::WriteFailed`] if the write fails (the session stays ready),
    /// [`Error::UnexpectedDisconnect`] or [`Error::Cancelled`] if the session
    /// ended while the write was in flight.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let (channel, attempt) = self.shared.ready_channel()?;
        if !channel.can_send() {
            return Err(Error::NotReady);
        }

        let result = channel.send(data).await;

        let mut inner = self.shared.inner.lock();
        if !inner.is_current(attempt) {
            debug!("Discarding send result of a closed session: {:?}", result);
            return Err(inner.preemption_error(attempt));
        }

        match result {
            Ok(()) => {
                inner.log.push_sent(Bytes::copy_from_slice(data));
                Ok(())
            }
            Err(e) => {
                drop(inner);
                self.shared.notify(Notice::warning(format!("Send failed: {}", e)));
                Err(e)
            }
        }
    }

    /// Send a text message.
    pub async fn send_text(&self, text: &str) -> Result<()> {
        self.send(text.as_bytes()).await
    }

    /// Read a characteristic of the bound service.
    pub async fn read(&self, uuid: Uuid) -> Result<Vec<u8>> {
        let (channel, attempt) = self.shared.ready_channel()?;

        let result = channel.read(uuid).await;

        let inner = self.shared.inner.lock();
        if !inner.is_current(attempt) {
            return Err(inner.preemption_error(attempt));
        }
        result
    }

    /// Read a string value from a characteristic.
    pub async fn read_string(&self, uuid: Uuid) -> Result<String> {
        let data = self.read(uuid).await?;
        String::from_utf8(data).map_err(|_| Error::ReadFailed {
            reason: format!("Invalid UTF-8 in characteristic {}", uuid),
        })
    }

    /// Read the battery level in percent (battery profile).
    pub async fn read_battery_level(&self) -> Result<u8> {
        let data = self.read(BATTERY_LEVEL_UUID).await?;
        data.first().copied().ok_or_else(|| Error::ReadFailed {
            reason: "empty battery level".to_string(),
        })
    }

    /// Read the manufacturer name (device information profile).
    pub async fn read_manufacturer_name(&self) -> Result<String> {
        self.read_string(MANUFACTURER_NAME_UUID).await
    }

    /// Read the model number (device information profile).
    pub async fn read_model_number(&self) -> Result<String> {
        self.read_string(MODEL_NUMBER_UUID).await
    }

    /// Read the serial number (device information profile).
    pub async fn read_serial_number(&self) -> Result<String> {
        self.read_string(SERIAL_NUMBER_UUID).await
    }

    /// Read the firmware revision (device information profile).
    pub async fn read_firmware_revision(&self) -> Result<String> {
        self.read_string(FIRMWARE_REVISION_UUID).await
    }

    /// Read the hardware revision (device information profile).
    pub async fn read_hardware_revision(&self) -> Result<String> {
        self.read_string(HARDWARE_REVISION_UUID).await
    }

    /// Apply a transport event.
    ///
    /// Transports reach this through the sinks the session hands them; it is
    /// public so hosts bridging their own event sources can feed it directly.
    pub fn handle_event(&self, event: TransportEvent) {
        self.shared.handle_event(event);
    }

    // === Callbacks ===

    /// Register a callback for received frames.
    pub fn on_frame<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(Frame) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let SessionEvent::FrameReceived(frame) = event {
                callback(frame);
            }
        })
    }

    /// Register a callback for state changes.
    pub fn on_state_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(SessionState, SessionState) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let SessionEvent::StateChanged { from, to } = event {
                callback(from, to);
            }
        })
    }

    /// Register a callback for user-facing notices.
    pub fn on_notice<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(Notice) + Send + Sync + 'static,
    {
        self.on_event(move |event| {
            if let SessionEvent::Notice(notice) = event {
                callback(notice);
            }
        })
    }

    fn on_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        let callback_id = self.shared.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.shared.event_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => callback(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Session callback lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }
}

impl<T: Transport + 'static> Shared<T> {
    /// Move to `to` and tell observers.
    fn transition(&self, inner: &mut Inner<T>, to: SessionState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;

        debug!("Session state changed: {} -> {}", from, to);
        let _ = self.event_tx.send(SessionEvent::StateChanged { from, to });
    }

    fn notify(&self, notice: Notice) {
        match notice.level {
            NoticeLevel::Info => info!("{}", notice.message),
            NoticeLevel::Warning => warn!("{}", notice.message),
            NoticeLevel::Error => error!("{}", notice.message),
        }
        let _ = self.event_tx.send(SessionEvent::Notice(notice));
    }

    /// Forget the peripheral and return to `Disconnected`, superseding any
    /// step still in flight.
    fn reset(&self, inner: &mut Inner<T>, reason: DisconnectReason) {
        inner.attempt += 1;
        inner.peripheral = None;
        inner.connection = None;
        inner.pending = None;
        inner.channel = None;
        inner.log.push_marker(Marker::Disconnected { reason });
        self.transition(inner, SessionState::Disconnected);
    }

    fn event_sink(self: &Arc<Self>) -> EventSink {
        let shared = Arc::downgrade(self);
        EventSink::new(move |event| {
            if let Some(shared) = shared.upgrade() {
                shared.handle_event(event);
            }
        })
    }

    fn handle_event(&self, event: TransportEvent) {
        let mut inner = self.inner.lock();

        match event {
            TransportEvent::Disconnected { connection } => {
                if inner.connection.as_ref().map(ConnectionHandle::id) != Some(connection) {
                    debug!("Ignoring link-down of stale connection {}", connection);
                    return;
                }

                let name = inner.device_name().unwrap_or_default();
                if inner.state == SessionState::Disconnecting {
                    self.reset(&mut inner, DisconnectReason::UserRequested);
                    drop(inner);
                    self.notify(Notice::info(format!("Disconnected from {}", name)));
                } else {
                    warn!("Link lost in state {}", inner.state);
                    self.reset(&mut inner, DisconnectReason::LinkLost);
                    drop(inner);
                    self.notify(Notice::error(format!("Connection to {} lost", name)));
                }
            }
            TransportEvent::Notification {
                connection,
                characteristic,
                data,
            } => {
                let channel = inner.channel.as_ref().or(inner.pending.as_ref());
                let frame = match channel {
                    Some(channel) if channel.accepts(connection, characteristic) => {
                        channel.frame(data)
                    }
                    _ => {
                        debug!(
                            "Ignoring {} byte notification from {} on {}",
                            data.len(),
                            characteristic,
                            connection
                        );
                        return;
                    }
                };

                trace!("Frame received: {}", frame);
                if frame.has_decode_error() {
                    warn!("Received a frame that is not valid UTF-8");
                }

                inner.log.push_frame(frame.clone());
                let _ = self.event_tx.send(SessionEvent::FrameReceived(frame));
            }
        }
    }

    fn begin_attempt(&self) -> Result<u64> {
        let mut inner = self.inner.lock();

        if inner.state.is_active() {
            debug!("Connect rejected in state {}", inner.state);
            return Err(Error::SessionAlreadyActive { state: inner.state });
        }

        inner.attempt += 1;
        inner.cancelled_attempt = None;
        inner.log.push_marker(Marker::Requesting);
        self.transition(&mut inner, SessionState::Requesting);

        info!("Starting connection with profile {}", self.config.profile);

        Ok(inner.attempt)
    }

    /// Commit a transition for `attempt` unless it was superseded.
    fn advance(
        &self,
        attempt: u64,
        to: SessionState,
        update: impl FnOnce(&mut Inner<T>),
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.is_current(attempt) {
            return Err(inner.preemption_error(attempt));
        }
        update(&mut *inner);
        self.transition(&mut inner, to);
        Ok(())
    }

    fn ensure_current(&self, attempt: u64) -> Result<()> {
        let inner = self.inner.lock();
        if inner.is_current(attempt) {
            Ok(())
        } else {
            Err(inner.preemption_error(attempt))
        }
    }

    fn ready_channel(&self) -> Result<(CharacteristicChannel<T>, u64)> {
        let inner = self.inner.lock();
        match (&inner.channel, inner.state) {
            (Some(channel), SessionState::Ready) => Ok((channel.clone(), inner.attempt)),
            _ => Err(Error::NotReady),
        }
    }

    async fn run_pipeline(self: &Arc<Self>, attempt: u64) -> Result<PeripheralHandle> {
        let profile = &self.config.profile;

        let filter = self.config.effective_filter();
        debug!("Requesting peripheral matching {:?}", filter);
        let peripheral = self
            .transport
            .request_peripheral(&filter)
            .await
            .map_err(selection_error)?;

        self.advance(attempt, SessionState::ConnectingGatt, |inner| {
            inner.log.push_marker(Marker::PeripheralSelected {
                name: peripheral.display_name().to_string(),
            });
            inner.peripheral = Some(peripheral.clone());
        })?;
        info!("Selected {}", peripheral);

        let connection = self
            .transport
            .connect_gatt(&peripheral)
            .await
            .map_err(connection_error)?;

        if let Err(e) = self.advance(attempt, SessionState::DiscoveringServices, |inner| {
            inner.log.push_marker(Marker::GattConnected);
            inner.connection = Some(connection.clone());
        }) {
            // Nobody else knows about this link.
            if let Err(close) = self.transport.disconnect(&connection).await {
                warn!("Failed to close superseded connection: {}", close);
            }
            return Err(e);
        }
        self.transport.on_disconnected(&connection, self.event_sink());
        debug!("GATT connected on {}", connection.id());

        let handles = match self.discover(attempt, &connection, profile).await {
            Ok(handles) => handles,
            Err(e) => return Err(self.teardown(attempt, &connection, e).await),
        };

        let channel =
            CharacteristicChannel::new(self.transport.clone(), handles, self.config.text_frames);
        self.advance(attempt, SessionState::SubscribingNotify, |inner| {
            inner.pending = Some(channel.clone());
        })?;

        if let Some(notify) = channel.handles().notify() {
            debug!("Subscribing to {}", notify.uuid);
            if let Err(e) = self
                .transport
                .subscribe(notify, self.event_sink())
                .await
                .map_err(subscription_error)
            {
                return Err(self.teardown(attempt, &connection, e).await);
            }
        }

        self.advance(attempt, SessionState::Ready, |inner| {
            inner.channel = inner.pending.take();
            inner.log.push_marker(Marker::Ready);
        })?;

        self.notify(Notice::info(format!(
            "Connected to {}",
            peripheral.display_name()
        )));

        Ok(peripheral)
    }

    async fn discover(
        &self,
        attempt: u64,
        connection: &ConnectionHandle,
        profile: &ServiceProfile,
    ) -> Result<CharacteristicHandles> {
        let service = self
            .transport
            .resolve_service(connection, profile.service())
            .await
            .map_err(|e| service_error(e, profile.service()))?;
        debug!("Resolved service {}", service.uuid);

        let mut resolved = Vec::new();
        for (uuid, role) in profile.required_characteristics() {
            self.ensure_current(attempt)?;
            let handle = self
                .transport
                .resolve_characteristic(&service, uuid, role)
                .await
                .map_err(|e| characteristic_error(e, uuid))?;
            debug!("Resolved {} characteristic {}", role, uuid);
            resolved.push(handle);
        }
        self.ensure_current(attempt)?;

        CharacteristicHandles::from_resolved(profile, service, resolved)
    }

    /// Close the connection of a failed attempt before the failure is reported.
    async fn teardown(&self, attempt: u64, connection: &ConnectionHandle, error: Error) -> Error {
        {
            let mut inner = self.inner.lock();
            if !inner.is_current(attempt) {
                return inner.preemption_error(attempt);
            }
            // Its link-down event is expected from here on.
            inner.connection = None;
            inner.pending = None;
            self.transition(&mut inner, SessionState::Disconnecting);
        }

        warn!("{}; closing {}", error, connection.id());
        if let Err(e) = self.transport.disconnect(connection).await {
            warn!("Failed to close connection after error: {}", e);
        }

        error
    }

    /// Record the failure of `attempt` and pick the error reported to the caller.
    fn fail_attempt(&self, attempt: u64, error: Error) -> Error {
        let mut inner = self.inner.lock();

        if !inner.is_current(attempt) {
            debug!("Attempt {} superseded; discarding: {}", attempt, error);
            return inner.preemption_error(attempt);
        }

        let torn_down = inner.state == SessionState::Disconnecting;
        inner.log.push_marker(Marker::Error {
            message: error.to_string(),
        });
        if torn_down {
            inner.log.push_marker(Marker::Disconnected {
                reason: DisconnectReason::Failed,
            });
        }
        inner.attempt += 1;
        inner.peripheral = None;
        inner.connection = None;
        inner.pending = None;
        inner.channel = None;
        self.transition(&mut inner, SessionState::Disconnected);
        drop(inner);

        let notice = match &error {
            Error::SelectionCancelled => Notice::warning("Device selection cancelled"),
            other => Notice::error(other.to_string()),
        };
        self.notify(notice);

        error
    }

    async fn wait_until_released(
        &self,
        connection: &ConnectionHandle,
        events: &mut broadcast::Receiver<SessionEvent>,
    ) {
        loop {
            {
                let inner = self.inner.lock();
                if inner.connection.as_ref().map(ConnectionHandle::id) != Some(connection.id()) {
                    return;
                }
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }
}

fn selection_error(e: Error) -> Error {
    match e {
        Error::SelectionCancelled | Error::SelectionError { .. } => e,
        other => Error::SelectionError {
            reason: other.to_string(),
        },
    }
}

fn connection_error(e: Error) -> Error {
    match e {
        Error::ConnectionFailed { .. } | Error::UnexpectedDisconnect => e,
        other => Error::ConnectionFailed {
            reason: other.to_string(),
        },
    }
}

fn service_error(e: Error, uuid: Uuid) -> Error {
    match e {
        Error::ServiceNotFound { .. } | Error::UnexpectedDisconnect => e,
        other => {
            debug!("Resolving service {} failed: {}", uuid, other);
            Error::ServiceNotFound {
                uuid: uuid.to_string(),
            }
        }
    }
}

fn characteristic_error(e: Error, uuid: Uuid) -> Error {
    match e {
        Error::CharacteristicNotFound { .. } | Error::UnexpectedDisconnect => e,
        other => {
            debug!("Resolving characteristic {} failed: {}", uuid, other);
            Error::CharacteristicNotFound {
                uuid: uuid.to_string(),
            }
        }
    }
}

fn subscription_error(e: Error) -> Error {
    match e {
        Error::SubscriptionFailed { .. } | Error::UnexpectedDisconnect => e,
        other => Error::SubscriptionFailed {
            reason: other.to_string(),
        },
    }
}
