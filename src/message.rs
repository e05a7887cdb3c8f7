//! Wire-message records
//!
//! Plain data records exchanged with the (out-of-scope) transport layer:
//! uplinks and downlinks with their gateway and protocol metadata, and the
//! activation request/response pair. Metadata variants are tagged unions;
//! consumers match explicitly.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::device::{DevAddr, EUI64};
use crate::lorawan::mac::DataDownlink;
use crate::lorawan::region::DataRate;

/// Radio modulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modulation {
    /// LoRa chirp spread spectrum
    Lora,
    /// Frequency-shift keying
    Fsk,
}

/// LoRaWAN-specific protocol metadata of a received uplink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LorawanMetadata {
    /// Modulation of the uplink
    pub modulation: Modulation,
    /// Data rate the uplink was received at
    pub data_rate: DataRate,
    /// Coding rate, e.g. `"4/5"`
    pub coding_rate: String,
    /// Band the receiving gateways operate in
    pub band: String,
    /// Observed frame counter (16 wire bits)
    pub f_cnt: u32,
}

/// Protocol metadata variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProtocolMetadata {
    /// LoRaWAN uplink metadata
    Lorawan(LorawanMetadata),
}

/// Reception metadata contributed by one gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayMetadata {
    /// Gateway identifier
    pub gateway_id: String,
    /// Gateway-local timestamp in microseconds
    pub timestamp: u32,
    /// Wall-clock reception time, when the gateway has one
    pub time: Option<SystemTime>,
    /// Received signal strength in dBm
    pub rssi: f32,
    /// Signal-to-noise ratio in dB
    pub snr: f32,
    /// Reception frequency in Hz
    pub frequency: u32,
    /// Gateway channel index
    pub channel: u32,
}

/// Transmission settings on the gateway side of a downlink option
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayTxConfig {
    /// Gateway identifier
    pub gateway_id: String,
    /// Gateway-local emission timestamp in microseconds
    pub timestamp: u32,
    /// Transmission frequency in Hz
    pub frequency: u32,
    /// Transmission power in dBm
    pub power: i32,
}

/// Transmission settings on the protocol side of a downlink option
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LorawanTxConfig {
    /// Modulation of the downlink
    pub modulation: Modulation,
    /// Data rate to transmit at
    pub data_rate: DataRate,
    /// Coding rate, e.g. `"4/5"`
    pub coding_rate: String,
}

/// One possible delivery path for a downlink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownlinkOption {
    /// Option identifier, unique within one uplink
    pub identifier: String,
    /// Gateway radio configuration
    pub gateway_config: GatewayTxConfig,
    /// Protocol (regional) configuration
    pub protocol_config: LorawanTxConfig,
    /// Preference score; lower is better
    pub score: u32,
    /// Latest instant the transmission can still be scheduled
    pub deadline: Option<SystemTime>,
}

/// A deduplicated, resolved uplink
#[derive(Debug, Clone)]
pub struct UplinkMessage {
    /// Raw PHY payload
    pub payload: Vec<u8>,
    /// Protocol metadata
    pub protocol: ProtocolMetadata,
    /// One entry per gateway that received the frame
    pub gateways: Vec<GatewayMetadata>,
    /// Delivery options collected from the receiving gateways
    pub downlink_options: Vec<DownlinkOption>,
    /// Response prepared by the resolution pipeline
    pub response_template: Option<DownlinkMessage>,
    /// Application the frame resolved to
    pub app_id: Option<String>,
    /// Device the frame resolved to
    pub dev_id: Option<String>,
}

/// A downlink scheduled for one device
#[derive(Debug, Clone)]
pub struct DownlinkMessage {
    /// Raw PHY payload; empty until the frame is sealed
    pub payload: Vec<u8>,
    /// Chosen delivery option
    pub option: Option<DownlinkOption>,
    /// Structured frame, available until sealing
    pub frame: Option<DataDownlink>,
}

/// Activation (join) metadata carried alongside the join-request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationMetadata {
    /// Application EUI from the join-request
    pub app_eui: EUI64,
    /// Device EUI from the join-request
    pub dev_eui: EUI64,
    /// Address allocated by the network server, once assigned
    pub dev_addr: Option<DevAddr>,
    /// RX1 data-rate offset offered to the device
    pub rx1_dr_offset: u8,
    /// RX2 data-rate index offered to the device
    pub rx2_data_rate: u8,
    /// RX delay in seconds
    pub rx_delay: u8,
    /// Optional channel-frequency list for the join-accept
    pub cf_list: Option<[u8; 16]>,
}

/// Activation metadata variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProtocolActivationMetadata {
    /// LoRaWAN join metadata
    Lorawan(ActivationMetadata),
}

/// An OTAA join-request on its way through the stack
#[derive(Debug, Clone)]
pub struct ActivationRequest {
    /// Raw join-request PHY payload
    pub payload: Vec<u8>,
    /// Activation metadata; must be LoRaWAN to be processable
    pub metadata: Option<ProtocolActivationMetadata>,
    /// Response template; absent when no response is expected
    pub response_template: Option<ActivationResponse>,
}

/// The join-accept answering an activation request
#[derive(Debug, Clone, Default)]
pub struct ActivationResponse {
    /// Join-accept PHY payload (encrypted once sealed)
    pub payload: Vec<u8>,
    /// Delivery option for the join-accept
    pub option: Option<DownlinkOption>,
}
