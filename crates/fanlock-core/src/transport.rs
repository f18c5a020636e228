//! Transport boundary.
//!
//! The engine never does network I/O. Everything handed to a transport is
//! already encrypted; implementations only move opaque bytes to a device.

use async_trait::async_trait;
use bytes::Bytes;

use crate::{error::EngineError, message::DeviceId};

/// Acknowledgement of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryAck {
    /// Device the payload was accepted for
    pub device_id: DeviceId,
}

/// Delivers encrypted payloads to devices.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver an opaque payload to a device.
    async fn deliver(&self, target: DeviceId, payload: Bytes) -> Result<DeliveryAck, EngineError>;
}

/// Transport that drops every payload and acknowledges it.
///
/// For tests and for contexts that run without a delivery path.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn deliver(&self, target: DeviceId, _payload: Bytes) -> Result<DeliveryAck, EngineError> {
        Ok(DeliveryAck { device_id: target })
    }
}

/// Transport backed by an in-process channel.
///
/// Tests receive `(device, payload)` pairs on the paired receiver and
/// assert on what the engine handed off.
pub struct ChannelTransport {
    tx: tokio::sync::mpsc::UnboundedSender<(DeviceId, Bytes)>,
}

impl ChannelTransport {
    /// Create a transport and the receiver observing its deliveries.
    pub fn new() -> (Self, tokio::sync::mpsc::UnboundedReceiver<(DeviceId, Bytes)>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn deliver(&self, target: DeviceId, payload: Bytes) -> Result<DeliveryAck, EngineError> {
        self.tx
            .send((target, payload))
            .map_err(|_| EngineError::TransportFailed { reason: "receiver dropped".to_string() })?;
        Ok(DeliveryAck { device_id: target })
    }
}
