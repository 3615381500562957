//! Characteristic I/O channel.
//!
//! Once a session is ready it owns exactly one [`CharacteristicChannel`]: the
//! resolved write/notify handles of the active connection plus the transport
//! they are driven through.

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::profile::ServiceProfile;
use crate::ble::transport::{
    CharacteristicHandle, CharacteristicRole, ConnectionId, ServiceRef, Transport,
};
use crate::error::{Error, Result};
use crate::session::frame::Frame;
use crate::utils::hex_preview;

/// Characteristic handles resolved for one connection.
///
/// Only constructible through [`CharacteristicHandles::from_resolved`], which
/// refuses a set that does not cover every role the profile declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandles {
    service: ServiceRef,
    write: Option<CharacteristicHandle>,
    notify: Option<CharacteristicHandle>,
}

impl CharacteristicHandles {
    /// Assemble handles for `profile` from what discovery resolved.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CharacteristicNotFound`] naming the first declared
    /// characteristic that is missing or was resolved on another connection.
    pub fn from_resolved(
        profile: &ServiceProfile,
        service: ServiceRef,
        resolved: Vec<CharacteristicHandle>,
    ) -> Result<Self> {
        let mut write = None;
        let mut notify = None;

        for handle in resolved {
            if handle.connection != service.connection {
                continue;
            }
            match handle.role {
                CharacteristicRole::Write if Some(handle.uuid) == profile.rx() => {
                    write = Some(handle)
                }
                CharacteristicRole::Notify if Some(handle.uuid) == profile.tx() => {
                    notify = Some(handle)
                }
                _ => {}
            }
        }

        if let (Some(rx), None) = (profile.rx(), &write) {
            return Err(Error::CharacteristicNotFound {
                uuid: rx.to_string(),
            });
        }
        if let (Some(tx), None) = (profile.tx(), &notify) {
            return Err(Error::CharacteristicNotFound {
                uuid: tx.to_string(),
            });
        }

        Ok(Self {
            service,
            write,
            notify,
        })
    }

    /// Connection the handles belong to.
    pub fn connection(&self) -> ConnectionId {
        self.service.connection
    }

    /// Resolved service.
    pub fn service(&self) -> &ServiceRef {
        &self.service
    }

    /// Write handle, if the profile has one.
    pub fn write(&self) -> Option<&CharacteristicHandle> {
        self.write.as_ref()
    }

    /// Notify handle, if the profile has one.
    pub fn notify(&self) -> Option<&CharacteristicHandle> {
        self.notify.as_ref()
    }
}

/// Send/receive surface over a resolved handle pair.
pub struct CharacteristicChannel<T: Transport> {
    transport: Arc<T>,
    handles: CharacteristicHandles,
    text_frames: bool,
}

impl<T: Transport> Clone for CharacteristicChannel<T> {
    fn clone(&self) -> Self {
        Self {
            transport: self.transport.clone(),
            handles: self.handles.clone(),
            text_frames: self.text_frames,
        }
    }
}

impl<T: Transport> CharacteristicChannel<T> {
    /// Bind a channel to resolved handles.
    pub fn new(transport: Arc<T>, handles: CharacteristicHandles, text_frames: bool) -> Self {
        Self {
            transport,
            handles,
            text_frames,
        }
    }

    /// The bound handles.
    pub fn handles(&self) -> &CharacteristicHandles {
        &self.handles
    }

    /// Connection the channel is bound to.
    pub fn connection(&self) -> ConnectionId {
        self.handles.connection()
    }

    /// Whether the channel can send.
    pub fn can_send(&self) -> bool {
        self.handles.write.is_some()
    }

    /// Write a payload to the write characteristic.
    ///
    /// # Errors
    ///
    /// [`Error::NotReady`] if the profile has no write characteristic,
    /// [`Error::WriteFailed`] if the transport rejects the write.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        let handle = self.handles.write.as_ref().ok_or(Error::NotReady)?;

        trace!("Writing {} bytes: {}", data.len(), hex_preview(data, 20));

        self.transport
            .write(handle, data)
            .await
            .map_err(|e| match e {
                Error::WriteFailed { .. } => e,
                other => Error::WriteFailed {
                    reason: other.to_string(),
                },
            })
    }

    /// Read any characteristic of the bound service.
    pub async fn read(&self, uuid: Uuid) -> Result<Vec<u8>> {
        let handle = self
            .transport
            .resolve_characteristic(&self.handles.service, uuid, CharacteristicRole::Read)
            .await?;

        let data = self.transport.read(&handle).await.map_err(|e| match e {
            Error::ReadFailed { .. } | Error::CharacteristicNotFound { .. } => e,
            other => Error::ReadFailed {
                reason: other.to_string(),
            },
        })?;

        debug!("Read {} bytes from characteristic {}", data.len(), uuid);

        Ok(data)
    }

    /// Whether an inbound notification belongs to this channel.
    pub fn accepts(&self, connection: ConnectionId, characteristic: Uuid) -> bool {
        connection == self.connection()
            && self
                .handles
                .notify
                .as_ref()
                .map(|h| h.uuid == characteristic)
                .unwrap_or(false)
    }

    /// Turn an inbound payload into a frame.
    pub fn frame(&self, data: Bytes) -> Frame {
        Frame::decode(data, self.text_frames)
    }
}
