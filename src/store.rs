//! Device session store contract
//!
//! The persistence backend is an external collaborator; this module defines
//! the contract the routing core programs against plus an in-memory
//! implementation used by tests and single-node deployments.
//!
//! `set` takes the list of changed field names produced by
//! [`SessionUpdate`](crate::device::SessionUpdate), so backends can apply a
//! partial optimistic update. Backends are responsible for serializing
//! concurrent read-modify-write cycles on the same identity.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;

use crate::device::{AESKey, DevAddr, DeviceSession, Frame, EUI64};
use crate::error::{Result, RoutingError};

/// Capacity of the per-session ADR frame history
pub const FRAME_HISTORY_LEN: usize = 20;

/// Contract of the device-session persistence backend
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Fetch a session by identity
    async fn get(&self, app_id: &str, dev_id: &str) -> Result<DeviceSession>;

    /// Fetch a session by its join identity, if provisioned
    async fn get_by_eui(&self, app_eui: &EUI64, dev_eui: &EUI64)
        -> Result<Option<DeviceSession>>;

    /// Application-level default key for devices provisioned only at the
    /// application
    async fn get_app_key(&self, app_eui: &EUI64) -> Result<Option<AESKey>>;

    /// All sessions currently bound to a network address.
    ///
    /// `fcnt_hint` is the observed 16-bit counter; backends may use it to
    /// pre-rank candidates but must not filter on it.
    async fn list_for_address(
        &self,
        dev_addr: DevAddr,
        fcnt_hint: Option<u16>,
    ) -> Result<Vec<DeviceSession>>;

    /// Persist a session; `changed` names the fields that differ from the
    /// snapshot the caller started from
    async fn set(&self, session: &DeviceSession, changed: &[&'static str]) -> Result<()>;

    /// Remove a session
    async fn delete(&self, app_id: &str, dev_id: &str) -> Result<()>;

    /// Push a frame onto the session's ADR history, evicting the oldest
    /// entry beyond [`FRAME_HISTORY_LEN`]
    async fn push_frame(&self, app_id: &str, dev_id: &str, frame: Frame) -> Result<()>;

    /// ADR history, most recent first
    async fn get_frames(&self, app_id: &str, dev_id: &str) -> Result<Vec<Frame>>;

    /// Drop the session's ADR history
    async fn clear_frames(&self, app_id: &str, dev_id: &str) -> Result<()>;
}

type Identity = (String, String);

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<Identity, DeviceSession>>,
    frames: RwLock<HashMap<Identity, VecDeque<Frame>>>,
    app_keys: RwLock<HashMap<EUI64, AESKey>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Provision an application-level default key
    pub fn set_app_key(&self, app_eui: EUI64, key: AESKey) {
        self.app_keys.write().insert(app_eui, key);
    }

    fn key(app_id: &str, dev_id: &str) -> Identity {
        (app_id.to_string(), dev_id.to_string())
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn get(&self, app_id: &str, dev_id: &str) -> Result<DeviceSession> {
        self.sessions
            .read()
            .get(&Self::key(app_id, dev_id))
            .cloned()
            .ok_or(RoutingError::NotFound)
    }

    async fn get_by_eui(
        &self,
        app_eui: &EUI64,
        dev_eui: &EUI64,
    ) -> Result<Option<DeviceSession>> {
        Ok(self
            .sessions
            .read()
            .values()
            .find(|s| &s.app_eui == app_eui && &s.dev_eui == dev_eui)
            .cloned())
    }

    async fn get_app_key(&self, app_eui: &EUI64) -> Result<Option<AESKey>> {
        Ok(self.app_keys.read().get(app_eui).copied())
    }

    async fn list_for_address(
        &self,
        dev_addr: DevAddr,
        _fcnt_hint: Option<u16>,
    ) -> Result<Vec<DeviceSession>> {
        Ok(self
            .sessions
            .read()
            .values()
            .filter(|s| s.dev_addr == dev_addr)
            .cloned()
            .collect())
    }

    async fn set(&self, session: &DeviceSession, changed: &[&'static str]) -> Result<()> {
        trace!(
            app_id = %session.app_id,
            dev_id = %session.dev_id,
            ?changed,
            "storing session"
        );
        self.sessions.write().insert(
            Self::key(&session.app_id, &session.dev_id),
            session.clone(),
        );
        Ok(())
    }

    async fn delete(&self, app_id: &str, dev_id: &str) -> Result<()> {
        let key = Self::key(app_id, dev_id);
        self.sessions.write().remove(&key);
        self.frames.write().remove(&key);
        Ok(())
    }

    async fn push_frame(&self, app_id: &str, dev_id: &str, frame: Frame) -> Result<()> {
        let mut frames = self.frames.write();
        let history = frames.entry(Self::key(app_id, dev_id)).or_default();
        history.push_front(frame);
        history.truncate(FRAME_HISTORY_LEN);
        Ok(())
    }

    async fn get_frames(&self, app_id: &str, dev_id: &str) -> Result<Vec<Frame>> {
        Ok(self
            .frames
            .read()
            .get(&Self::key(app_id, dev_id))
            .map(|h| h.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn clear_frames(&self, app_id: &str, dev_id: &str) -> Result<()> {
        self.frames.write().remove(&Self::key(app_id, dev_id));
        Ok(())
    }
}
