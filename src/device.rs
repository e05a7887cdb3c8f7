//! Device session model
//!
//! This module contains the session state a network server keeps per device:
//! identity, address, session keys, frame counters, activation options, ADR
//! state and the nonce bookkeeping used by OTAA. Sessions are owned by the
//! [`store`](crate::store); callers mutate them through a [`SessionUpdate`]
//! so the store receives the exact set of changed fields.

use std::collections::HashSet;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::lorawan::region::DataRate;

/// EUI-64 (8 bytes)
pub type EUI64 = [u8; 8];

/// AES-128 key (16 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AESKey([u8; 16]);

impl AESKey {
    /// Create a key from raw bytes
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Key bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for AESKey {
    // Session keys must not leak into logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AESKey(..)")
    }
}

/// Device address (4 bytes, stored most-significant byte first)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DevAddr([u8; 4]);

impl DevAddr {
    /// Create an address from raw bytes, most-significant first
    pub fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    /// Address bytes, most-significant first
    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Address as a 32-bit integer
    pub fn to_u32(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// Address from a 32-bit integer
    pub fn from_u32(value: u32) -> Self {
        Self(value.to_be_bytes())
    }

    /// Wire representation (LoRaWAN transmits the address LSB first)
    pub fn to_wire(self) -> [u8; 4] {
        let mut bytes = self.0;
        bytes.reverse();
        bytes
    }

    /// Parse the wire representation (LSB first)
    pub fn from_wire(bytes: [u8; 4]) -> Self {
        let mut bytes = bytes;
        bytes.reverse();
        Self(bytes)
    }
}

impl fmt::Debug for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevAddr({:08X})", self.to_u32())
    }
}

/// Address prefix shared by a pool of devices.
///
/// The high `length` bits of `base` are fixed; the remaining bits are free
/// for random allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevAddrPrefix {
    /// Prefix bits, most-significant first
    pub base: DevAddr,
    /// Number of significant leading bits (0-32)
    pub length: u8,
}

impl DevAddrPrefix {
    /// Create a prefix
    pub fn new(base: DevAddr, length: u8) -> Self {
        Self {
            base,
            length: length.min(32),
        }
    }

    fn mask(&self) -> u32 {
        if self.length == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(self.length))
        }
    }

    /// Whether `addr` falls inside this prefix
    pub fn matches(&self, addr: DevAddr) -> bool {
        addr.to_u32() & self.mask() == self.base.to_u32() & self.mask()
    }

    /// Overlay the prefix bits onto a randomly generated address
    pub fn apply(&self, random: DevAddr) -> DevAddr {
        let mask = self.mask();
        DevAddr::from_u32(self.base.to_u32() & mask | random.to_u32() & !mask)
    }
}

/// Per-device activation options
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActivationOptions {
    /// Skip all frame-counter validation for this device
    pub disable_fcnt_check: bool,
    /// Device transmits 32-bit frame counters (16-bit LSB on the wire)
    pub uses_32bit_fcnt: bool,
    /// Constraint tags matched against address-prefix usage tags
    pub activation_constraints: Vec<String>,
}

/// Per-session ADR state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdrSettings {
    /// Band the device operates in, once observed
    pub band: Option<String>,
    /// Installation margin in dB applied to the ADR computation
    pub margin: f32,
    /// Desired data rate (last observed, or last recommended)
    pub data_rate: Option<DataRate>,
    /// Desired tx power in dBm
    pub tx_power: Option<i32>,
    /// Requested redundancy (transmissions per uplink)
    pub nb_trans: Option<u8>,
    /// An ADR acknowledgment was requested by the device
    pub pending: bool,
    /// A LinkADRReq was sent and its answer is outstanding
    pub expect_res: bool,
    /// Consecutive LinkADRAns rejections
    pub failed: u32,
}

impl Default for AdrSettings {
    fn default() -> Self {
        Self {
            band: None,
            margin: crate::adr::DEFAULT_ADR_MARGIN,
            data_rate: None,
            tx_power: None,
            nb_trans: None,
            pending: false,
            expect_res: false,
            failed: 0,
        }
    }
}

/// One entry of the bounded ADR uplink history
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Full frame counter of the uplink
    pub fcnt: u32,
    /// Best SNR observed across the gateways that received the frame
    pub max_snr: f32,
    /// Number of gateways that received the frame
    pub gateway_count: u32,
}

/// Session state for a single device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSession {
    /// Application identifier
    pub app_id: String,
    /// Device identifier within the application
    pub dev_id: String,
    /// Application EUI
    pub app_eui: EUI64,
    /// Device EUI
    pub dev_eui: EUI64,
    /// Assigned network address
    pub dev_addr: DevAddr,
    /// Network session key (MAC-layer integrity)
    pub nwk_skey: AESKey,
    /// Application session key (payload encryption)
    pub app_skey: AESKey,
    /// Application key; present only for OTAA devices
    pub app_key: Option<AESKey>,
    /// Uplink frame counter (full 32 bits)
    pub fcnt_up: u32,
    /// Downlink frame counter (full 32 bits)
    pub fcnt_down: u32,
    /// Activation options
    pub options: ActivationOptions,
    /// ADR state
    pub adr: AdrSettings,
    /// DevNonces consumed by past joins
    pub used_dev_nonces: HashSet<u16>,
    /// AppNonces issued by past joins
    pub used_app_nonces: HashSet<[u8; 3]>,
    /// Last uplink seen from the device
    pub last_seen: Option<SystemTime>,
    /// When the current session was activated
    pub activated_at: Option<SystemTime>,
}

impl DeviceSession {
    /// Every persistable field name, in declaration order; used when a
    /// freshly created session must be written in full
    pub fn all_fields() -> &'static [&'static str] {
        &[
            "app_id",
            "dev_id",
            "app_eui",
            "dev_eui",
            "dev_addr",
            "nwk_skey",
            "app_skey",
            "app_key",
            "fcnt_up",
            "fcnt_down",
            "options",
            "adr",
            "used_dev_nonces",
            "used_app_nonces",
            "last_seen",
            "activated_at",
        ]
    }

    /// Create a session skeleton for a known identity
    pub fn new(app_id: impl Into<String>, dev_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            dev_id: dev_id.into(),
            app_eui: [0; 8],
            dev_eui: [0; 8],
            dev_addr: DevAddr::new([0; 4]),
            nwk_skey: AESKey::new([0; 16]),
            app_skey: AESKey::new([0; 16]),
            app_key: None,
            fcnt_up: 0,
            fcnt_down: 0,
            options: ActivationOptions::default(),
            adr: AdrSettings::default(),
            used_dev_nonces: HashSet::new(),
            used_app_nonces: HashSet::new(),
            last_seen: None,
            activated_at: None,
        }
    }
}

/// Change-tracking wrapper around a session.
///
/// Starts from a snapshot and derives the list of changed field names on
/// write, so a persistence backend can apply a partial, optimistic update
/// instead of a blind overwrite.
#[derive(Debug, Clone)]
pub struct SessionUpdate {
    original: DeviceSession,
    current: DeviceSession,
}

impl SessionUpdate {
    /// Start tracking changes against `session`
    pub fn start(session: DeviceSession) -> Self {
        Self {
            original: session.clone(),
            current: session,
        }
    }

    /// Field names that differ from the snapshot
    pub fn changed_fields(&self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        let (a, b) = (&self.original, &self.current);
        if a.app_eui != b.app_eui {
            changed.push("app_eui");
        }
        if a.dev_eui != b.dev_eui {
            changed.push("dev_eui");
        }
        if a.dev_addr != b.dev_addr {
            changed.push("dev_addr");
        }
        if a.nwk_skey != b.nwk_skey {
            changed.push("nwk_skey");
        }
        if a.app_skey != b.app_skey {
            changed.push("app_skey");
        }
        if a.app_key != b.app_key {
            changed.push("app_key");
        }
        if a.fcnt_up != b.fcnt_up {
            changed.push("fcnt_up");
        }
        if a.fcnt_down != b.fcnt_down {
            changed.push("fcnt_down");
        }
        if a.options != b.options {
            changed.push("options");
        }
        if a.adr != b.adr {
            changed.push("adr");
        }
        if a.used_dev_nonces != b.used_dev_nonces {
            changed.push("used_dev_nonces");
        }
        if a.used_app_nonces != b.used_app_nonces {
            changed.push("used_app_nonces");
        }
        if a.last_seen != b.last_seen {
            changed.push("last_seen");
        }
        if a.activated_at != b.activated_at {
            changed.push("activated_at");
        }
        changed
    }

    /// Finish the update, yielding the session and its changed-field list
    pub fn into_parts(self) -> (DeviceSession, Vec<&'static str>) {
        let changed = self.changed_fields();
        (self.current, changed)
    }
}

impl Deref for SessionUpdate {
    type Target = DeviceSession;

    fn deref(&self) -> &DeviceSession {
        &self.current
    }
}

impl DerefMut for SessionUpdate {
    fn deref_mut(&mut self) -> &mut DeviceSession {
        &mut self.current
    }
}

/// Hex form of an EUI, used to derive identifiers for devices provisioned
/// only by EUI
pub fn eui_hex(eui: &EUI64) -> String {
    let mut out = String::with_capacity(16);
    for byte in eui {
        use fmt::Write;
        // infallible for String
        let _ = write!(out, "{byte:02x}");
    }
    out
}
