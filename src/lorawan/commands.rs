//! MAC command codec
//!
//! LoRaWAN reuses each command identifier in both directions (request one
//! way, answer the other), so parsing is direction-aware. The full 1.0.x
//! command set is parseable and serializable; the processing pipeline acts
//! on LinkCheck and LinkADR and skips the rest.

use heapless::Vec as HVec;

use crate::crypto::Direction;
use crate::error::{Result, RoutingError};

/// MAC command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacCommand {
    /// Link check request
    LinkCheckReq,
    /// Link check answer
    LinkCheckAns {
        /// Link margin in dB
        margin: u8,
        /// Number of gateways that received the request
        gateway_count: u8,
    },
    /// Link ADR request
    LinkADRReq {
        /// Data rate index
        data_rate: u8,
        /// TX power index
        tx_power: u8,
        /// Channel mask
        ch_mask: u16,
        /// Channel mask control
        ch_mask_cntl: u8,
        /// Number of transmissions per uplink
        nb_trans: u8,
    },
    /// Link ADR answer
    LinkADRAns {
        /// Power ACK
        power_ack: bool,
        /// Data rate ACK
        data_rate_ack: bool,
        /// Channel mask ACK
        channel_mask_ack: bool,
    },
    /// Duty cycle request
    DutyCycleReq {
        /// Maximum duty cycle exponent
        max_duty_cycle: u8,
    },
    /// Duty cycle answer
    DutyCycleAns,
    /// RX parameter setup request
    RXParamSetupReq {
        /// RX1 data rate offset
        rx1_dr_offset: u8,
        /// RX2 data rate index
        rx2_data_rate: u8,
        /// RX2 frequency in 100 Hz steps
        freq: u32,
    },
    /// RX parameter setup answer
    RXParamSetupAns {
        /// RX1 data rate offset ACK
        rx1_dr_offset_ack: bool,
        /// RX2 data rate ACK
        rx2_data_rate_ack: bool,
        /// Channel ACK
        channel_ack: bool,
    },
    /// Device status request
    DevStatusReq,
    /// Device status answer
    DevStatusAns {
        /// Battery level (0 = external power, 1-254 = level, 255 = unknown)
        battery: u8,
        /// Demodulation margin of the last downlink, dB
        margin: i8,
    },
    /// New channel request
    NewChannelReq {
        /// Channel index
        ch_index: u8,
        /// Frequency in 100 Hz steps
        freq: u32,
        /// Maximum data rate index
        max_dr: u8,
        /// Minimum data rate index
        min_dr: u8,
    },
    /// New channel answer
    NewChannelAns {
        /// Channel frequency OK
        channel_freq_ok: bool,
        /// Data rate range OK
        data_rate_ok: bool,
    },
    /// RX timing setup request
    RXTimingSetupReq {
        /// Delay in seconds (0 maps to 1)
        delay: u8,
    },
    /// RX timing setup answer
    RXTimingSetupAns,
    /// TX parameter setup request
    TxParamSetupReq {
        /// Downlink dwell time limited
        downlink_dwell_time: bool,
        /// Uplink dwell time limited
        uplink_dwell_time: bool,
        /// Maximum EIRP index
        max_eirp: u8,
    },
    /// TX parameter setup answer
    TxParamSetupAns,
    /// Downlink channel request
    DlChannelReq {
        /// Channel index
        ch_index: u8,
        /// Frequency in 100 Hz steps
        freq: u32,
    },
    /// Downlink channel answer
    DlChannelAns {
        /// Channel frequency OK
        channel_freq_ok: bool,
        /// Uplink frequency exists
        uplink_freq_exists: bool,
    },
}

impl MacCommand {
    /// Command identifier byte
    pub fn cid(&self) -> u8 {
        match self {
            MacCommand::LinkCheckReq | MacCommand::LinkCheckAns { .. } => 0x02,
            MacCommand::LinkADRReq { .. } | MacCommand::LinkADRAns { .. } => 0x03,
            MacCommand::DutyCycleReq { .. } | MacCommand::DutyCycleAns => 0x04,
            MacCommand::RXParamSetupReq { .. } | MacCommand::RXParamSetupAns { .. } => 0x05,
            MacCommand::DevStatusReq | MacCommand::DevStatusAns { .. } => 0x06,
            MacCommand::NewChannelReq { .. } | MacCommand::NewChannelAns { .. } => 0x07,
            MacCommand::RXTimingSetupReq { .. } | MacCommand::RXTimingSetupAns => 0x08,
            MacCommand::TxParamSetupReq { .. } | MacCommand::TxParamSetupAns => 0x09,
            MacCommand::DlChannelReq { .. } | MacCommand::DlChannelAns { .. } => 0x0A,
        }
    }

    /// Payload length (bytes after the identifier) for a command arriving
    /// from the given direction
    fn payload_len(cid: u8, dir: Direction) -> Option<usize> {
        Some(match (cid, dir) {
            (0x02, Direction::Up) => 0,   // LinkCheckReq
            (0x02, Direction::Down) => 2, // LinkCheckAns
            (0x03, Direction::Up) => 1,   // LinkADRAns
            (0x03, Direction::Down) => 4, // LinkADRReq
            (0x04, Direction::Up) => 0,
            (0x04, Direction::Down) => 1,
            (0x05, Direction::Up) => 1,
            (0x05, Direction::Down) => 4,
            (0x06, Direction::Up) => 2,
            (0x06, Direction::Down) => 0,
            (0x07, Direction::Up) => 1,
            (0x07, Direction::Down) => 5,
            (0x08, Direction::Up) => 0,
            (0x08, Direction::Down) => 1,
            (0x09, Direction::Up) => 0,
            (0x09, Direction::Down) => 1,
            (0x0A, Direction::Up) => 1,
            (0x0A, Direction::Down) => 4,
            _ => return None,
        })
    }

    /// Parse one command from its identifier and payload
    pub fn from_bytes(cid: u8, dir: Direction, payload: &[u8]) -> Option<Self> {
        if payload.len() < Self::payload_len(cid, dir)? {
            return None;
        }
        match (cid, dir) {
            (0x02, Direction::Up) => Some(MacCommand::LinkCheckReq),
            (0x02, Direction::Down) => Some(MacCommand::LinkCheckAns {
                margin: payload[0],
                gateway_count: payload[1],
            }),
            (0x03, Direction::Down) => Some(MacCommand::LinkADRReq {
                data_rate: payload[0] >> 4,
                tx_power: payload[0] & 0x0F,
                ch_mask: u16::from_le_bytes([payload[1], payload[2]]),
                ch_mask_cntl: (payload[3] >> 4) & 0x07,
                nb_trans: payload[3] & 0x0F,
            }),
            (0x03, Direction::Up) => Some(MacCommand::LinkADRAns {
                power_ack: (payload[0] & 0x04) != 0,
                data_rate_ack: (payload[0] & 0x02) != 0,
                channel_mask_ack: (payload[0] & 0x01) != 0,
            }),
            (0x04, Direction::Down) => Some(MacCommand::DutyCycleReq {
                max_duty_cycle: payload[0] & 0x0F,
            }),
            (0x04, Direction::Up) => Some(MacCommand::DutyCycleAns),
            (0x05, Direction::Down) => Some(MacCommand::RXParamSetupReq {
                rx1_dr_offset: (payload[0] >> 4) & 0x07,
                rx2_data_rate: payload[0] & 0x0F,
                freq: u32::from_le_bytes([payload[1], payload[2], payload[3], 0]),
            }),
            (0x05, Direction::Up) => Some(MacCommand::RXParamSetupAns {
                rx1_dr_offset_ack: (payload[0] & 0x04) != 0,
                rx2_data_rate_ack: (payload[0] & 0x02) != 0,
                channel_ack: (payload[0] & 0x01) != 0,
            }),
            (0x06, Direction::Down) => Some(MacCommand::DevStatusReq),
            (0x06, Direction::Up) => Some(MacCommand::DevStatusAns {
                battery: payload[0],
                margin: (payload[1] & 0x3F) as i8,
            }),
            (0x07, Direction::Down) => Some(MacCommand::NewChannelReq {
                ch_index: payload[0],
                freq: u32::from_le_bytes([payload[1], payload[2], payload[3], 0]),
                max_dr: payload[4] >> 4,
                min_dr: payload[4] & 0x0F,
            }),
            (0x07, Direction::Up) => Some(MacCommand::NewChannelAns {
                channel_freq_ok: (payload[0] & 0x02) != 0,
                data_rate_ok: (payload[0] & 0x01) != 0,
            }),
            (0x08, Direction::Down) => Some(MacCommand::RXTimingSetupReq {
                delay: payload[0] & 0x0F,
            }),
            (0x08, Direction::Up) => Some(MacCommand::RXTimingSetupAns),
            (0x09, Direction::Down) => Some(MacCommand::TxParamSetupReq {
                downlink_dwell_time: (payload[0] & 0x20) != 0,
                uplink_dwell_time: (payload[0] & 0x10) != 0,
                max_eirp: payload[0] & 0x0F,
            }),
            (0x09, Direction::Up) => Some(MacCommand::TxParamSetupAns),
            (0x0A, Direction::Down) => Some(MacCommand::DlChannelReq {
                ch_index: payload[0],
                freq: u32::from_le_bytes([payload[1], payload[2], payload[3], 0]),
            }),
            (0x0A, Direction::Up) => Some(MacCommand::DlChannelAns {
                channel_freq_ok: (payload[0] & 0x02) != 0,
                uplink_freq_exists: (payload[0] & 0x01) != 0,
            }),
            _ => None,
        }
    }

    /// Append the serialized command (identifier included) to `out`
    pub fn write(&self, out: &mut HVec<u8, 15>) -> Result<()> {
        fn overflow<T>(_: T) -> RoutingError {
            RoutingError::invalid("MAC commands exceed FOpts capacity")
        }
        out.push(self.cid()).map_err(overflow)?;
        match self {
            MacCommand::LinkCheckReq
            | MacCommand::DutyCycleAns
            | MacCommand::DevStatusReq
            | MacCommand::RXTimingSetupAns
            | MacCommand::TxParamSetupAns => {}
            MacCommand::LinkCheckAns {
                margin,
                gateway_count,
            } => {
                out.extend_from_slice(&[*margin, *gateway_count])
                    .map_err(overflow)?;
            }
            MacCommand::LinkADRReq {
                data_rate,
                tx_power,
                ch_mask,
                ch_mask_cntl,
                nb_trans,
            } => {
                let mask = ch_mask.to_le_bytes();
                out.extend_from_slice(&[
                    (data_rate << 4) | (tx_power & 0x0F),
                    mask[0],
                    mask[1],
                    ((ch_mask_cntl & 0x07) << 4) | (nb_trans & 0x0F),
                ])
                .map_err(overflow)?;
            }
            MacCommand::LinkADRAns {
                power_ack,
                data_rate_ack,
                channel_mask_ack,
            } => {
                let mut status = 0u8;
                if *power_ack {
                    status |= 0x04;
                }
                if *data_rate_ack {
                    status |= 0x02;
                }
                if *channel_mask_ack {
                    status |= 0x01;
                }
                out.push(status).map_err(overflow)?;
            }
            MacCommand::DutyCycleReq { max_duty_cycle } => {
                out.push(max_duty_cycle & 0x0F).map_err(overflow)?;
            }
            MacCommand::RXParamSetupReq {
                rx1_dr_offset,
                rx2_data_rate,
                freq,
            } => {
                let f = freq.to_le_bytes();
                out.extend_from_slice(&[
                    ((rx1_dr_offset & 0x07) << 4) | (rx2_data_rate & 0x0F),
                    f[0],
                    f[1],
                    f[2],
                ])
                .map_err(overflow)?;
            }
            MacCommand::RXParamSetupAns {
                rx1_dr_offset_ack,
                rx2_data_rate_ack,
                channel_ack,
            } => {
                let mut status = 0u8;
                if *rx1_dr_offset_ack {
                    status |= 0x04;
                }
                if *rx2_data_rate_ack {
                    status |= 0x02;
                }
                if *channel_ack {
                    status |= 0x01;
                }
                out.push(status).map_err(overflow)?;
            }
            MacCommand::DevStatusAns { battery, margin } => {
                out.extend_from_slice(&[*battery, (*margin as u8) & 0x3F])
                    .map_err(overflow)?;
            }
            MacCommand::NewChannelReq {
                ch_index,
                freq,
                max_dr,
                min_dr,
            } => {
                let f = freq.to_le_bytes();
                out.extend_from_slice(&[
                    *ch_index,
                    f[0],
                    f[1],
                    f[2],
                    (max_dr << 4) | (min_dr & 0x0F),
                ])
                .map_err(overflow)?;
            }
            MacCommand::NewChannelAns {
                channel_freq_ok,
                data_rate_ok,
            } => {
                let mut status = 0u8;
                if *channel_freq_ok {
                    status |= 0x02;
                }
                if *data_rate_ok {
                    status |= 0x01;
                }
                out.push(status).map_err(overflow)?;
            }
            MacCommand::RXTimingSetupReq { delay } => {
                out.push(delay & 0x0F).map_err(overflow)?;
            }
            MacCommand::TxParamSetupReq {
                downlink_dwell_time,
                uplink_dwell_time,
                max_eirp,
            } => {
                let mut byte = max_eirp & 0x0F;
                if *downlink_dwell_time {
                    byte |= 0x20;
                }
                if *uplink_dwell_time {
                    byte |= 0x10;
                }
                out.push(byte).map_err(overflow)?;
            }
            MacCommand::DlChannelReq { ch_index, freq } => {
                let f = freq.to_le_bytes();
                out.extend_from_slice(&[*ch_index, f[0], f[1], f[2]])
                    .map_err(overflow)?;
            }
            MacCommand::DlChannelAns {
                channel_freq_ok,
                uplink_freq_exists,
            } => {
                let mut status = 0u8;
                if *channel_freq_ok {
                    status |= 0x02;
                }
                if *uplink_freq_exists {
                    status |= 0x01;
                }
                out.push(status).map_err(overflow)?;
            }
        }
        Ok(())
    }
}

/// Parse a FOpts (or port-0 FRMPayload) byte run into commands
pub fn parse_all(data: &[u8], dir: Direction) -> Result<Vec<MacCommand>> {
    let mut commands = Vec::new();
    let mut rest = data;
    while let Some((&cid, tail)) = rest.split_first() {
        let len = MacCommand::payload_len(cid, dir)
            .ok_or_else(|| RoutingError::invalid("unknown MAC command"))?;
        if tail.len() < len {
            return Err(RoutingError::invalid("truncated MAC command"));
        }
        let (payload, remaining) = tail.split_at(len);
        let command = MacCommand::from_bytes(cid, dir, payload)
            .ok_or_else(|| RoutingError::invalid("unknown MAC command"))?;
        commands.push(command);
        rest = remaining;
    }
    Ok(commands)
}

/// Serialize commands into a FOpts buffer
pub fn write_all(commands: &[MacCommand]) -> Result<HVec<u8, 15>> {
    let mut out = HVec::new();
    for command in commands {
        command.write(&mut out)?;
    }
    Ok(out)
}
