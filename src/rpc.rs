//! Transport-agnostic RPC boundary
//!
//! The routing core is driven over these traits; the wire transport that
//! carries them (streaming reconnection included) lives outside this crate.

use std::sync::Arc;

use async_trait::async_trait;

use crate::activation::ActivationCoordinator;
use crate::device::{DevAddr, DeviceSession};
use crate::error::Result;
use crate::message::{ActivationRequest, ActivationResponse, DownlinkMessage, UplinkMessage};
use crate::store::DeviceStore;
use crate::uplink::UplinkResolver;

/// Candidate-session lookup offered to peers
#[async_trait]
pub trait DeviceRpc: Send + Sync {
    /// All sessions bound to `dev_addr`; `fcnt_hint` is the observed 16-bit
    /// counter
    async fn get_devices(
        &self,
        dev_addr: DevAddr,
        fcnt_hint: Option<u16>,
    ) -> Result<Vec<DeviceSession>>;
}

/// The activation half of the boundary
#[async_trait]
pub trait ActivationRpc: Send + Sync {
    /// Network-server phase of a join; `None` for dedup contributors
    async fn prepare_activation(
        &self,
        request: ActivationRequest,
    ) -> Result<Option<ActivationRequest>>;

    /// Handler phase of a join; `None` for dedup contributors
    async fn activate(&self, request: ActivationRequest) -> Result<Option<ActivationResponse>>;
}

/// The data-routing half of the boundary
#[async_trait]
pub trait RoutingRpc: Send + Sync {
    /// Process one gateway uplink; `None` for dedup contributors
    async fn uplink(&self, message: UplinkMessage) -> Result<Option<UplinkMessage>>;

    /// Process one scheduled downlink
    async fn downlink(&self, message: DownlinkMessage) -> Result<DownlinkMessage>;
}

/// Store-backed candidate lookup
pub struct StoreDeviceRpc {
    store: Arc<dyn DeviceStore>,
}

impl StoreDeviceRpc {
    /// Expose a store over the RPC boundary
    pub fn new(store: Arc<dyn DeviceStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DeviceRpc for StoreDeviceRpc {
    async fn get_devices(
        &self,
        dev_addr: DevAddr,
        fcnt_hint: Option<u16>,
    ) -> Result<Vec<DeviceSession>> {
        self.store.list_for_address(dev_addr, fcnt_hint).await
    }
}

#[async_trait]
impl ActivationRpc for ActivationCoordinator {
    async fn prepare_activation(
        &self,
        request: ActivationRequest,
    ) -> Result<Option<ActivationRequest>> {
        ActivationCoordinator::prepare_activation(self, request).await
    }

    async fn activate(&self, request: ActivationRequest) -> Result<Option<ActivationResponse>> {
        ActivationCoordinator::activate(self, request).await
    }
}

#[async_trait]
impl RoutingRpc for UplinkResolver {
    async fn uplink(&self, message: UplinkMessage) -> Result<Option<UplinkMessage>> {
        self.handle_uplink(message).await
    }

    async fn downlink(&self, message: DownlinkMessage) -> Result<DownlinkMessage> {
        self.handle_downlink(message).await
    }
}
