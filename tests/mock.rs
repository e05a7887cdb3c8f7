//! Shared helpers for the test suites: canned sessions, hand-built PHY
//! payloads and message scaffolding.

#![allow(dead_code)]

use std::sync::Arc;

use loranet::crypto::{self, Direction};
use loranet::device::{AESKey, DevAddr, DeviceSession, EUI64};
use loranet::lorawan::region::DataRate;
use loranet::message::{
    ActivationMetadata, ActivationRequest, ActivationResponse, DownlinkOption, GatewayMetadata,
    GatewayTxConfig, LorawanMetadata, LorawanTxConfig, Modulation, ProtocolActivationMetadata,
    ProtocolMetadata, UplinkMessage,
};
use loranet::store::{DeviceStore, MemoryStore};

pub const NWK_SKEY: [u8; 16] = [0x01; 16];
pub const APP_SKEY: [u8; 16] = [0x02; 16];
pub const APP_KEY: [u8; 16] = [0x03; 16];
pub const DEV_ADDR: [u8; 4] = [0x26, 0x01, 0x13, 0x37];

/// A session bound to [`DEV_ADDR`] with 32-bit counters enabled
pub fn session(app_id: &str, dev_id: &str) -> DeviceSession {
    let mut session = DeviceSession::new(app_id, dev_id);
    session.app_eui = [0xA0; 8];
    session.dev_eui = [0xD0; 8];
    session.dev_addr = DevAddr::new(DEV_ADDR);
    session.nwk_skey = AESKey::new(NWK_SKEY);
    session.app_skey = AESKey::new(APP_SKEY);
    session.options.uses_32bit_fcnt = true;
    session
}

/// Store preloaded with one session
pub async fn store_with(session: &DeviceSession) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store
        .set(session, DeviceSession::all_fields())
        .await
        .expect("seed session");
    store
}

/// Frame-control byte for a hand-built uplink
pub fn fctrl(adr: bool, adr_ack_req: bool, f_opts_len: u8) -> u8 {
    let mut byte = f_opts_len & 0x0F;
    if adr {
        byte |= 0x80;
    }
    if adr_ack_req {
        byte |= 0x40;
    }
    byte
}

/// Build a signed unconfirmed data uplink the way a device would
pub fn uplink_payload(
    nwk_skey: &AESKey,
    app_skey: &AESKey,
    dev_addr: DevAddr,
    full_fcnt: u32,
    f_ctrl: u8,
    f_opts: &[u8],
    f_port: Option<u8>,
    frm_payload: &[u8],
) -> Vec<u8> {
    let mut buffer = vec![0x40]; // unconfirmed data up
    buffer.extend_from_slice(&dev_addr.to_wire());
    buffer.push(f_ctrl | (f_opts.len() as u8 & 0x0F));
    buffer.extend_from_slice(&(full_fcnt as u16).to_le_bytes());
    buffer.extend_from_slice(f_opts);
    if let Some(port) = f_port {
        buffer.push(port);
        let key = if port == 0 { nwk_skey } else { app_skey };
        let encrypted =
            crypto::encrypt_payload(key, dev_addr, full_fcnt, Direction::Up, frm_payload);
        buffer.extend_from_slice(&encrypted);
    }
    let mic = crypto::compute_mic(nwk_skey, &buffer, dev_addr, full_fcnt, Direction::Up);
    buffer.extend_from_slice(&mic);
    buffer
}

/// Build a signed join-request the way a device would
pub fn join_request(app_eui: &EUI64, dev_eui: &EUI64, dev_nonce: u16, app_key: &AESKey) -> Vec<u8> {
    let mut buffer = vec![0x00]; // join request
    buffer.extend(app_eui.iter().rev());
    buffer.extend(dev_eui.iter().rev());
    buffer.extend_from_slice(&dev_nonce.to_le_bytes());
    let mic = crypto::compute_join_mic(app_key, &buffer);
    buffer.extend_from_slice(&mic);
    buffer
}

/// Reception metadata for one gateway
pub fn gateway(gateway_id: &str, snr: f32) -> GatewayMetadata {
    GatewayMetadata {
        gateway_id: gateway_id.to_string(),
        timestamp: 1_000_000,
        time: None,
        rssi: -100.0,
        snr,
        frequency: 868_100_000,
        channel: 0,
    }
}

/// A downlink option offered by a gateway
pub fn option(identifier: &str, score: u32) -> DownlinkOption {
    DownlinkOption {
        identifier: identifier.to_string(),
        gateway_config: GatewayTxConfig {
            gateway_id: identifier.to_string(),
            timestamp: 2_000_000,
            frequency: 868_100_000,
            power: 14,
        },
        protocol_config: LorawanTxConfig {
            modulation: Modulation::Lora,
            data_rate: DataRate::SF7BW125,
            coding_rate: "4/5".to_string(),
        },
        score,
        deadline: None,
    }
}

/// Wrap a payload into the message one gateway would deliver
pub fn uplink_message(
    payload: Vec<u8>,
    band: &str,
    data_rate: DataRate,
    gateways: Vec<GatewayMetadata>,
    downlink_options: Vec<DownlinkOption>,
) -> UplinkMessage {
    let f_cnt = if payload.len() >= 8 {
        u32::from(u16::from_le_bytes([payload[6], payload[7]]))
    } else {
        0
    };
    UplinkMessage {
        payload,
        protocol: ProtocolMetadata::Lorawan(LorawanMetadata {
            modulation: Modulation::Lora,
            data_rate,
            coding_rate: "4/5".to_string(),
            band: band.to_string(),
            f_cnt,
        }),
        gateways,
        downlink_options,
        response_template: None,
        app_id: None,
        dev_id: None,
    }
}

/// An activation request carrying a join-request payload
pub fn activation_request(
    payload: Vec<u8>,
    app_eui: EUI64,
    dev_eui: EUI64,
    dev_addr: Option<DevAddr>,
    with_response: bool,
) -> ActivationRequest {
    ActivationRequest {
        payload,
        metadata: Some(ProtocolActivationMetadata::Lorawan(ActivationMetadata {
            app_eui,
            dev_eui,
            dev_addr,
            rx1_dr_offset: 0,
            rx2_data_rate: 0,
            rx_delay: 1,
            cf_list: None,
        })),
        response_template: if with_response {
            Some(ActivationResponse::default())
        } else {
            None
        },
    }
}
