//! Over-The-Air Activation
//!
//! Three phases, the first two serialized per join-request payload through
//! the deduplicator so concurrent joins for the same device cannot allocate
//! conflicting addresses or keys:
//!
//! 1. **prepare** (network-server side) — allocate a fresh DevAddr from the
//!    prefix pool matching the device's activation constraints and attach a
//!    join-accept template to the response.
//! 2. **activate** (handler side) — validate the join-request MIC, enforce
//!    DevNonce single-use, derive session keys, persist them durably, then
//!    seal the join-accept. A response is never sent for a join whose state
//!    was not committed first.
//! 3. **finalize** (network-server side) — reset counters, clear ADR
//!    history and stamp the activation time.

use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::config::{NetworkConfig, TimingConfig};
use crate::crypto;
use crate::dedup::Deduplicator;
use crate::device::{eui_hex, AESKey, DevAddr, DeviceSession, SessionUpdate};
use crate::error::{Result, RoutingError};
use crate::lorawan::mac::{self, JoinAcceptPayload, PhyPayload};
use crate::message::{
    ActivationMetadata, ActivationRequest, ActivationResponse, ProtocolActivationMetadata,
};
use crate::store::DeviceStore;

/// Broker-side registration of address-to-device bindings.
///
/// Activation registers the new address before persisting the session; when
/// the persistence write fails the registration is rolled back best-effort.
#[async_trait]
pub trait AddressRegistry: Send + Sync {
    /// Bind an address to a device
    async fn register(&self, dev_addr: DevAddr, app_id: &str, dev_id: &str) -> Result<()>;

    /// Remove a binding
    async fn unregister(&self, dev_addr: DevAddr, app_id: &str, dev_id: &str) -> Result<()>;
}

/// Orchestrates the OTAA join protocol
pub struct ActivationCoordinator {
    store: Arc<dyn DeviceStore>,
    network: NetworkConfig,
    prepare_dedup: Deduplicator<ActivationRequest>,
    activate_dedup: Deduplicator<ActivationRequest>,
    registry: Option<Arc<dyn AddressRegistry>>,
}

impl ActivationCoordinator {
    /// Create a coordinator on top of a session store
    pub fn new(store: Arc<dyn DeviceStore>, network: NetworkConfig, timing: &TimingConfig) -> Self {
        Self {
            store,
            network,
            prepare_dedup: Deduplicator::new(timing.activation_window),
            activate_dedup: Deduplicator::new(timing.activation_window),
            registry: None,
        }
    }

    /// Attach a broker-side address registry
    pub fn with_registry(mut self, registry: Arc<dyn AddressRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Network-server phase: allocate an address and attach the join-accept
    /// template.
    ///
    /// Contributors to an open collection return `Ok(None)`.
    pub async fn prepare_activation(
        &self,
        request: ActivationRequest,
    ) -> Result<Option<ActivationRequest>> {
        let key = request.payload.clone();
        let mut duplicates = self.prepare_dedup.deduplicate(&key, request).await;
        if duplicates.is_empty() {
            return Ok(None);
        }
        self.prepare(duplicates.swap_remove(0)).await.map(Some)
    }

    async fn prepare(&self, mut request: ActivationRequest) -> Result<ActivationRequest> {
        // Nothing to allocate when no response is expected.
        if request.response_template.is_none() {
            return Ok(request);
        }

        let (app_eui, dev_eui) = match &request.metadata {
            Some(ProtocolActivationMetadata::Lorawan(meta)) => (meta.app_eui, meta.dev_eui),
            None => return Err(RoutingError::invalid("missing activation metadata")),
        };

        let mut constraints = match self.store.get_by_eui(&app_eui, &dev_eui).await? {
            Some(device) => device.options.activation_constraints,
            None => Vec::new(),
        };
        if !constraints.iter().any(|tag| tag == "otaa") {
            constraints.push("otaa".to_string());
        }

        let pool: Vec<_> = self
            .network
            .prefixes
            .iter()
            .filter(|p| p.tags.iter().any(|tag| constraints.contains(tag)))
            .collect();

        let mut rng = rand::thread_rng();
        let prefix = pool.choose(&mut rng).ok_or(RoutingError::Unavailable)?;
        let mut random = [0u8; 4];
        rng.fill(&mut random[..]);
        let dev_addr = prefix.prefix.apply(DevAddr::new(random));

        debug!(?dev_addr, app_eui = %eui_hex(&app_eui), dev_eui = %eui_hex(&dev_eui),
            "allocated device address");

        let accept = JoinAcceptPayload {
            // The handler fills the AppNonce when it seals the accept.
            app_nonce: [0; 3],
            net_id: self.network.net_id,
            dev_addr,
            dl_settings: (self.network.rx1_dr_offset << 4)
                | (self.network.rx2_data_rate & 0x0F),
            rx_delay: self.network.rx_delay,
            cf_list: self.network.cf_list,
        };

        if let Some(ProtocolActivationMetadata::Lorawan(meta)) = request.metadata.as_mut() {
            meta.dev_addr = Some(dev_addr);
            meta.rx1_dr_offset = self.network.rx1_dr_offset;
            meta.rx2_data_rate = self.network.rx2_data_rate;
            meta.rx_delay = self.network.rx_delay;
            meta.cf_list = self.network.cf_list;
        }
        if let Some(template) = request.response_template.as_mut() {
            template.payload = accept.serialize_plain().to_vec();
        }
        Ok(request)
    }

    /// Handler phase: validate, derive keys, persist, seal the join-accept.
    ///
    /// Contributors to an open collection return `Ok(None)`.
    pub async fn activate(
        &self,
        request: ActivationRequest,
    ) -> Result<Option<ActivationResponse>> {
        let key = request.payload.clone();
        let mut duplicates = self.activate_dedup.deduplicate(&key, request).await;
        if duplicates.is_empty() {
            return Ok(None);
        }
        self.do_activate(duplicates.swap_remove(0)).await.map(Some)
    }

    async fn do_activate(&self, request: ActivationRequest) -> Result<ActivationResponse> {
        let meta: &ActivationMetadata = match &request.metadata {
            Some(ProtocolActivationMetadata::Lorawan(meta)) => meta,
            None => return Err(RoutingError::invalid("missing activation metadata")),
        };

        let join = match mac::parse(&request.payload)? {
            PhyPayload::JoinRequest(join) => join,
            _ => return Err(RoutingError::invalid("expected a join-request")),
        };

        // Resolve the device, falling back to the application default key
        // for devices provisioned only at the application level.
        let (session, known) = match self.store.get_by_eui(&join.app_eui, &join.dev_eui).await? {
            Some(session) => (session, true),
            None => {
                let app_key = self
                    .store
                    .get_app_key(&join.app_eui)
                    .await?
                    .ok_or(RoutingError::NotFound)?;
                let mut session =
                    DeviceSession::new(eui_hex(&join.app_eui), eui_hex(&join.dev_eui));
                session.app_eui = join.app_eui;
                session.dev_eui = join.dev_eui;
                session.app_key = Some(app_key);
                (session, false)
            }
        };

        let app_key = session
            .app_key
            .ok_or_else(|| RoutingError::invalid("device has no application key"))?;

        if !mac::validate_join_mic(&request.payload, &app_key) {
            return Err(RoutingError::NoMatch);
        }
        if session.used_dev_nonces.contains(&join.dev_nonce) {
            return Err(RoutingError::AlreadyUsed);
        }
        let dev_addr = meta
            .dev_addr
            .ok_or_else(|| RoutingError::invalid("no device address allocated"))?;

        // The 2-byte DevNonce space is too small to avoid collisions, but
        // the 3-byte AppNonce space is ours to allocate: retry until fresh.
        let app_nonce = {
            let mut rng = rand::thread_rng();
            let mut nonce = [0u8; 3];
            loop {
                rng.fill(&mut nonce[..]);
                if !session.used_app_nonces.contains(&nonce) {
                    break nonce;
                }
            }
        };

        let (nwk_skey, app_skey) =
            crypto::derive_session_keys(&app_key, &app_nonce, &self.network.net_id, join.dev_nonce);

        let mut update = SessionUpdate::start(session);
        update.dev_addr = dev_addr;
        update.nwk_skey = nwk_skey;
        update.app_skey = app_skey;
        update.used_dev_nonces.insert(join.dev_nonce);
        update.used_app_nonces.insert(app_nonce);

        if let Some(registry) = &self.registry {
            registry
                .register(dev_addr, &update.app_id, &update.dev_id)
                .await?;
        }

        // Commit before answering: a duplicate join observed later must see
        // the nonce already consumed.
        let (session, changed) = update.into_parts();
        let changed: Vec<&'static str> = if known {
            changed
        } else {
            DeviceSession::all_fields().to_vec()
        };
        if let Err(err) = self.store.set(&session, &changed).await {
            error!(
                app_id = %session.app_id,
                dev_id = %session.dev_id,
                %err,
                "failed to persist activation"
            );
            if let Some(registry) = &self.registry {
                if let Err(rollback) = registry
                    .unregister(dev_addr, &session.app_id, &session.dev_id)
                    .await
                {
                    warn!(%rollback, "address registration rollback failed");
                }
            }
            return Err(err);
        }

        info!(
            app_id = %session.app_id,
            dev_id = %session.dev_id,
            ?dev_addr,
            "device activated"
        );

        let accept = JoinAcceptPayload {
            app_nonce,
            net_id: self.network.net_id,
            dev_addr,
            dl_settings: (meta.rx1_dr_offset << 4) | (meta.rx2_data_rate & 0x0F),
            rx_delay: meta.rx_delay,
            cf_list: meta.cf_list,
        };
        Ok(ActivationResponse {
            payload: accept.seal(&app_key),
            option: request.response_template.and_then(|t| t.option),
        })
    }

    /// Network-server phase: commit the final session once the handler path
    /// confirms the activation.
    pub async fn finalize(
        &self,
        app_id: &str,
        dev_id: &str,
        dev_addr: DevAddr,
        nwk_skey: AESKey,
        app_skey: AESKey,
    ) -> Result<()> {
        let session = self.store.get(app_id, dev_id).await?;
        let mut update = SessionUpdate::start(session);
        update.dev_addr = dev_addr;
        update.nwk_skey = nwk_skey;
        update.app_skey = app_skey;
        update.fcnt_up = 0;
        update.fcnt_down = 0;
        update.activated_at = Some(std::time::SystemTime::now());

        self.store.clear_frames(app_id, dev_id).await?;
        let (session, changed) = update.into_parts();
        self.store.set(&session, &changed).await
    }
}
