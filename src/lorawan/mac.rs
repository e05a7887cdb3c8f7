//! LoRaWAN MAC-layer frame codec
//!
//! Server-side parsing and construction of PHY payloads. The payload
//! variants (join-request / join-accept / data) are a tagged union; every
//! consumer matches on [`PhyPayload`] explicitly.

use heapless::Vec as HVec;

use crate::crypto::{self, Direction, MIC_SIZE};
use crate::device::{AESKey, DevAddr, EUI64};
use crate::error::{Result, RoutingError};
use crate::lorawan::commands::{self, MacCommand};

/// Maximum MAC payload size
pub const MAX_MAC_PAYLOAD_SIZE: usize = 242;

/// MAC header types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MType {
    /// Join request (device to network)
    JoinRequest = 0x00,
    /// Join accept (network to device)
    JoinAccept = 0x20,
    /// Unconfirmed data uplink
    UnconfirmedDataUp = 0x40,
    /// Unconfirmed data downlink
    UnconfirmedDataDown = 0x60,
    /// Confirmed data uplink
    ConfirmedDataUp = 0x80,
    /// Confirmed data downlink
    ConfirmedDataDown = 0xA0,
    /// Rejoin request
    RejoinRequest = 0xC0,
    /// Proprietary extension
    Proprietary = 0xE0,
}

impl MType {
    fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte & 0xE0 {
            0x00 => MType::JoinRequest,
            0x20 => MType::JoinAccept,
            0x40 => MType::UnconfirmedDataUp,
            0x60 => MType::UnconfirmedDataDown,
            0x80 => MType::ConfirmedDataUp,
            0xA0 => MType::ConfirmedDataDown,
            0xC0 => MType::RejoinRequest,
            0xE0 => MType::Proprietary,
            _ => return None,
        })
    }
}

/// Frame header flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FCtrl {
    /// Device has ADR enabled
    pub adr: bool,
    /// Device requests an ADR acknowledgment
    pub adr_ack_req: bool,
    /// Acknowledgment of the previous confirmed frame
    pub ack: bool,
    /// More downlink data is pending (downlink only)
    pub f_pending: bool,
    /// Length of the FOpts field (0-15)
    pub f_opts_len: u8,
}

impl FCtrl {
    fn to_byte(self) -> u8 {
        let mut byte = self.f_opts_len & 0x0F;
        if self.adr {
            byte |= 0x80;
        }
        if self.adr_ack_req {
            byte |= 0x40;
        }
        if self.ack {
            byte |= 0x20;
        }
        if self.f_pending {
            byte |= 0x10;
        }
        byte
    }

    fn from_byte(byte: u8) -> Self {
        Self {
            adr: (byte & 0x80) != 0,
            adr_ack_req: (byte & 0x40) != 0,
            ack: (byte & 0x20) != 0,
            f_pending: (byte & 0x10) != 0,
            f_opts_len: byte & 0x0F,
        }
    }
}

/// Frame header
#[derive(Debug, Clone)]
pub struct FHDR {
    /// Device address
    pub dev_addr: DevAddr,
    /// Frame control flags
    pub f_ctrl: FCtrl,
    /// Frame counter (16 wire bits)
    pub f_cnt: u16,
    /// MAC commands piggybacked in the header
    pub f_opts: HVec<u8, 15>,
}

/// Parsed data MAC payload
#[derive(Debug, Clone)]
pub struct DataPayload {
    /// Frame type (confirmed or unconfirmed, up or down)
    pub mtype: MType,
    /// Frame header
    pub fhdr: FHDR,
    /// Port; absent when the frame carries no FRMPayload
    pub f_port: Option<u8>,
    /// Encrypted application payload (or MAC commands when port is 0)
    pub frm_payload: Vec<u8>,
    /// Received MIC
    pub mic: [u8; MIC_SIZE],
}

/// Parsed join-request payload
#[derive(Debug, Clone)]
pub struct JoinRequestPayload {
    /// Application EUI
    pub app_eui: EUI64,
    /// Device EUI
    pub dev_eui: EUI64,
    /// Device nonce
    pub dev_nonce: u16,
    /// Received MIC
    pub mic: [u8; MIC_SIZE],
}

/// PHY payload variants
#[derive(Debug, Clone)]
pub enum PhyPayload {
    /// Join request
    JoinRequest(JoinRequestPayload),
    /// Join accept; the body is still encrypted under the AppKey
    JoinAccept(Vec<u8>),
    /// Data frame
    Data(DataPayload),
}

/// Parse a PHY payload
pub fn parse(bytes: &[u8]) -> Result<PhyPayload> {
    if bytes.len() < 1 + MIC_SIZE {
        return Err(RoutingError::invalid("payload too short"));
    }
    let mtype = MType::from_byte(bytes[0])
        .ok_or_else(|| RoutingError::invalid("unknown MAC header"))?;

    match mtype {
        MType::JoinRequest => parse_join_request(bytes),
        MType::JoinAccept => Ok(PhyPayload::JoinAccept(bytes[1..].to_vec())),
        MType::UnconfirmedDataUp
        | MType::ConfirmedDataUp
        | MType::UnconfirmedDataDown
        | MType::ConfirmedDataDown => parse_data(mtype, bytes),
        MType::RejoinRequest | MType::Proprietary => {
            Err(RoutingError::invalid("unsupported MAC frame type"))
        }
    }
}

fn parse_join_request(bytes: &[u8]) -> Result<PhyPayload> {
    // MHDR + AppEUI + DevEUI + DevNonce + MIC
    if bytes.len() != 1 + 8 + 8 + 2 + MIC_SIZE {
        return Err(RoutingError::invalid("join-request length mismatch"));
    }
    let mut app_eui: EUI64 = [0; 8];
    let mut dev_eui: EUI64 = [0; 8];
    // EUIs travel LSB first
    for i in 0..8 {
        app_eui[7 - i] = bytes[1 + i];
        dev_eui[7 - i] = bytes[9 + i];
    }
    let dev_nonce = u16::from_le_bytes([bytes[17], bytes[18]]);
    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&bytes[19..23]);
    Ok(PhyPayload::JoinRequest(JoinRequestPayload {
        app_eui,
        dev_eui,
        dev_nonce,
        mic,
    }))
}

fn parse_data(mtype: MType, bytes: &[u8]) -> Result<PhyPayload> {
    // MHDR + DevAddr + FCtrl + FCnt + MIC
    if bytes.len() < 1 + 4 + 1 + 2 + MIC_SIZE {
        return Err(RoutingError::invalid("data frame too short"));
    }
    let dev_addr = DevAddr::from_wire([bytes[1], bytes[2], bytes[3], bytes[4]]);
    let f_ctrl = FCtrl::from_byte(bytes[5]);
    let f_cnt = u16::from_le_bytes([bytes[6], bytes[7]]);
    let f_opts_len = usize::from(f_ctrl.f_opts_len);

    let body_end = bytes.len() - MIC_SIZE;
    if 8 + f_opts_len > body_end {
        return Err(RoutingError::invalid("FOpts exceed frame"));
    }
    let mut f_opts = HVec::new();
    f_opts
        .extend_from_slice(&bytes[8..8 + f_opts_len])
        .map_err(|_| RoutingError::invalid("FOpts too long"))?;

    let rest = &bytes[8 + f_opts_len..body_end];
    let (f_port, frm_payload) = match rest.split_first() {
        Some((&port, payload)) => (Some(port), payload.to_vec()),
        None => (None, Vec::new()),
    };

    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&bytes[body_end..]);

    Ok(PhyPayload::Data(DataPayload {
        mtype,
        fhdr: FHDR {
            dev_addr,
            f_ctrl,
            f_cnt,
            f_opts,
        },
        f_port,
        frm_payload,
        mic,
    }))
}

/// Validate the MIC of a received data frame against a session key
///
/// `bytes` is the raw PHY payload as received; `full_fcnt` the resolved
/// 32-bit counter.
pub fn validate_data_mic(
    bytes: &[u8],
    key: &AESKey,
    dev_addr: DevAddr,
    full_fcnt: u32,
    dir: Direction,
) -> bool {
    if bytes.len() < 1 + MIC_SIZE {
        return false;
    }
    let body = &bytes[..bytes.len() - MIC_SIZE];
    let mic = &bytes[bytes.len() - MIC_SIZE..];
    crypto::compute_mic(key, body, dev_addr, full_fcnt, dir) == mic
}

/// Validate the MIC of a received join-request against an application key
pub fn validate_join_mic(bytes: &[u8], key: &AESKey) -> bool {
    if bytes.len() < 1 + MIC_SIZE {
        return false;
    }
    let body = &bytes[..bytes.len() - MIC_SIZE];
    let mic = &bytes[bytes.len() - MIC_SIZE..];
    crypto::compute_join_mic(key, body) == mic
}

/// Join-accept payload in the clear
#[derive(Debug, Clone, PartialEq)]
pub struct JoinAcceptPayload {
    /// Application nonce issued by the network
    pub app_nonce: [u8; 3],
    /// Network identifier
    pub net_id: [u8; 3],
    /// Assigned device address
    pub dev_addr: DevAddr,
    /// RX1 data-rate offset (high nibble) and RX2 data-rate index (low)
    pub dl_settings: u8,
    /// Delay before the first receive window, seconds
    pub rx_delay: u8,
    /// Optional channel-frequency list
    pub cf_list: Option<[u8; 16]>,
}

impl JoinAcceptPayload {
    /// Serialize without MIC or encryption (MHDR included)
    pub fn serialize_plain(&self) -> HVec<u8, 256> {
        let mut buffer = HVec::new();
        let _ = buffer.push(MType::JoinAccept as u8);
        let _ = buffer.extend_from_slice(&self.app_nonce);
        let _ = buffer.extend_from_slice(&self.net_id);
        let _ = buffer.extend_from_slice(&self.dev_addr.to_wire());
        let _ = buffer.push(self.dl_settings);
        let _ = buffer.push(self.rx_delay);
        if let Some(cf_list) = &self.cf_list {
            let _ = buffer.extend_from_slice(cf_list);
        }
        buffer
    }

    /// Parse the plain (unencrypted, MIC-less) form produced by
    /// [`serialize_plain`](Self::serialize_plain)
    pub fn parse_plain(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 13 && bytes.len() != 29 {
            return Err(RoutingError::invalid("join-accept length mismatch"));
        }
        if MType::from_byte(bytes[0]) != Some(MType::JoinAccept) {
            return Err(RoutingError::invalid("not a join-accept"));
        }
        let mut app_nonce = [0u8; 3];
        app_nonce.copy_from_slice(&bytes[1..4]);
        let mut net_id = [0u8; 3];
        net_id.copy_from_slice(&bytes[4..7]);
        let dev_addr = DevAddr::from_wire([bytes[7], bytes[8], bytes[9], bytes[10]]);
        let cf_list = if bytes.len() == 29 {
            let mut cf = [0u8; 16];
            cf.copy_from_slice(&bytes[13..29]);
            Some(cf)
        } else {
            None
        };
        Ok(Self {
            app_nonce,
            net_id,
            dev_addr,
            dl_settings: bytes[11],
            rx_delay: bytes[12],
            cf_list,
        })
    }

    /// MIC and encrypt under the application key, yielding the full PHY
    /// payload ready for transmission
    pub fn seal(&self, app_key: &AESKey) -> Vec<u8> {
        let plain = self.serialize_plain();
        let mic = crypto::compute_join_mic(app_key, &plain);

        // Everything after the MHDR, MIC included, is wrapped.
        let mut body = Vec::with_capacity(plain.len() - 1 + MIC_SIZE);
        body.extend_from_slice(&plain[1..]);
        body.extend_from_slice(&mic);
        let sealed = crypto::encrypt_join_accept(app_key, &body);

        let mut out = Vec::with_capacity(1 + sealed.len());
        out.push(MType::JoinAccept as u8);
        out.extend_from_slice(&sealed);
        out
    }

    /// Device-side inverse of [`seal`](Self::seal), used by tests
    pub fn unseal(app_key: &AESKey, bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 1 + 12 + MIC_SIZE {
            return Err(RoutingError::invalid("join-accept too short"));
        }
        let body = crypto::decrypt_join_accept(app_key, &bytes[1..]);
        let (plain_body, mic) = body.split_at(body.len() - MIC_SIZE);

        let mut plain = Vec::with_capacity(1 + plain_body.len());
        plain.push(bytes[0]);
        plain.extend_from_slice(plain_body);
        if crypto::compute_join_mic(app_key, &plain) != mic {
            return Err(RoutingError::NoMatch);
        }
        Self::parse_plain(&plain)
    }
}

/// Structured downlink data frame, mutated by the MAC pipeline before being
/// sealed into wire bytes
#[derive(Debug, Clone)]
pub struct DataDownlink {
    /// Destination device address
    pub dev_addr: DevAddr,
    /// Send as confirmed downlink
    pub confirmed: bool,
    /// Acknowledge the uplink
    pub ack: bool,
    /// Full downlink frame counter
    pub f_cnt: u32,
    /// MAC commands to piggyback in FOpts
    pub f_opts: Vec<MacCommand>,
    /// Port; absent when there is no FRMPayload
    pub f_port: Option<u8>,
    /// Application payload in the clear
    pub frm_payload: Vec<u8>,
}

impl DataDownlink {
    /// Create an empty downlink for a device
    pub fn new(dev_addr: DevAddr, f_cnt: u32) -> Self {
        Self {
            dev_addr,
            confirmed: false,
            ack: false,
            f_cnt,
            f_opts: Vec::new(),
            f_port: None,
            frm_payload: Vec::new(),
        }
    }

    /// Whether the frame carries anything worth transmitting
    pub fn is_empty(&self) -> bool {
        !self.ack && self.f_opts.is_empty() && self.frm_payload.is_empty()
    }

    /// Serialize, encrypt and MIC the frame
    pub fn serialize(&self, nwk_skey: &AESKey, app_skey: &AESKey) -> Result<Vec<u8>> {
        let f_opts = commands::write_all(&self.f_opts)?;

        let mtype = if self.confirmed {
            MType::ConfirmedDataDown
        } else {
            MType::UnconfirmedDataDown
        };
        let f_ctrl = FCtrl {
            adr: false,
            adr_ack_req: false,
            ack: self.ack,
            f_pending: false,
            f_opts_len: f_opts.len() as u8,
        };

        let mut buffer = Vec::with_capacity(13 + f_opts.len() + self.frm_payload.len());
        buffer.push(mtype as u8);
        buffer.extend_from_slice(&self.dev_addr.to_wire());
        buffer.push(f_ctrl.to_byte());
        buffer.extend_from_slice(&(self.f_cnt as u16).to_le_bytes());
        buffer.extend_from_slice(&f_opts);

        if let Some(port) = self.f_port {
            buffer.push(port);
            // Port 0 carries MAC commands and is keyed with the network
            // session key; every other port with the application key.
            let key = if port == 0 { nwk_skey } else { app_skey };
            let encrypted = crypto::encrypt_payload(
                key,
                self.dev_addr,
                self.f_cnt,
                Direction::Down,
                &self.frm_payload,
            );
            buffer.extend_from_slice(&encrypted);
        }

        if buffer.len() > 1 + MAX_MAC_PAYLOAD_SIZE {
            return Err(RoutingError::invalid("downlink exceeds MAC payload size"));
        }

        let mic = crypto::compute_mic(
            nwk_skey,
            &buffer,
            self.dev_addr,
            self.f_cnt,
            Direction::Down,
        );
        buffer.extend_from_slice(&mic);
        Ok(buffer)
    }
}
