//! Adaptive Data Rate control and MAC command processing
//!
//! Per-session state machine driven once per uplink/downlink pair:
//! - uplinks with the ADR bit feed the bounded SNR history and record the
//!   desired data rate; uplinks without it opt the device out and clear it
//! - a downlink paired with an ADR acknowledgment request answers with the
//!   ACK bit, and, once the history is full, a LinkADRReq computed by the
//!   band plan
//! - LinkCheckReq is answered from the demodulation-floor table,
//!   LinkADRAns feeds the failure counter
//!
//! An `Unavailable` recommendation from the band plan skips the cycle
//! silently; it is not an error.

use tracing::{debug, warn};

use crate::device::{Frame, SessionUpdate};
use crate::error::Result;
use crate::lorawan::commands::MacCommand;
use crate::lorawan::mac::{DataDownlink, DataPayload};
use crate::lorawan::region::{self, DataRate};
use crate::message::{GatewayMetadata, LorawanMetadata, ProtocolMetadata, UplinkMessage};
use crate::store::{DeviceStore, FRAME_HISTORY_LEN};

/// Default installation margin in dB
pub const DEFAULT_ADR_MARGIN: f32 = 15.0;

/// Best SNR across a set of gateway observations
pub fn max_snr(gateways: &[GatewayMetadata]) -> f32 {
    gateways
        .iter()
        .map(|gw| gw.snr)
        .fold(None::<f32>, |best, snr| {
            Some(best.map_or(snr, |b| b.max(snr)))
        })
        .unwrap_or(0.0)
}

/// Link margin in dB for a LinkCheck answer.
///
/// Rates without a demodulation-floor entry yield margin 0.
pub fn link_margin(data_rate: DataRate, best_snr: f32) -> f32 {
    match data_rate.demodulation_floor() {
        Some(floor) => best_snr - floor,
        None => 0.0,
    }
}

fn lorawan_metadata(uplink: &UplinkMessage) -> &LorawanMetadata {
    match &uplink.protocol {
        ProtocolMetadata::Lorawan(meta) => meta,
    }
}

/// Update the session's ADR state for one received uplink.
///
/// The frame counter on `session` must already hold the resolved full value;
/// it keys the history entry.
pub async fn handle_uplink(
    store: &dyn DeviceStore,
    session: &mut SessionUpdate,
    uplink: &UplinkMessage,
    frame: &DataPayload,
) -> Result<()> {
    let meta = lorawan_metadata(uplink);

    if frame.fhdr.f_ctrl.adr {
        store
            .push_frame(
                &session.app_id,
                &session.dev_id,
                Frame {
                    fcnt: session.fcnt_up,
                    max_snr: max_snr(&uplink.gateways),
                    gateway_count: uplink.gateways.len() as u32,
                },
            )
            .await?;

        if session.adr.band.is_none() {
            session.adr.band = Some(meta.band.clone());
        }
        session.adr.data_rate = Some(meta.data_rate);
        session.adr.pending = frame.fhdr.f_ctrl.adr_ack_req;
    } else {
        // Device has opted out of ADR.
        store.clear_frames(&session.app_id, &session.dev_id).await?;
        session.adr.data_rate = None;
        session.adr.tx_power = None;
        session.adr.nb_trans = None;
    }

    Ok(())
}

/// Interpret the MAC commands carried by an uplink.
///
/// Commands that produce an answer need a response frame to write into; when
/// the uplink has no response path the answers are dropped.
pub fn process_commands(
    session: &mut SessionUpdate,
    uplink: &UplinkMessage,
    commands: &[MacCommand],
    mut response: Option<&mut DataDownlink>,
) {
    let meta = lorawan_metadata(uplink);

    for command in commands {
        match command {
            MacCommand::LinkCheckReq => {
                let margin = link_margin(meta.data_rate, max_snr(&uplink.gateways)).max(0.0);
                let answer = MacCommand::LinkCheckAns {
                    margin: margin as u8,
                    gateway_count: uplink.gateways.len() as u8,
                };
                match response.as_deref_mut() {
                    Some(frame) => frame.f_opts.push(answer),
                    None => debug!(
                        dev_id = %session.dev_id,
                        "no response path for LinkCheckAns"
                    ),
                }
            }
            MacCommand::LinkADRAns {
                power_ack,
                data_rate_ack,
                channel_mask_ack,
            } => {
                session.adr.expect_res = false;
                if *power_ack && *data_rate_ack && *channel_mask_ack {
                    session.adr.failed = 0;
                } else {
                    session.adr.failed += 1;
                    warn!(
                        dev_id = %session.dev_id,
                        failed = session.adr.failed,
                        power_ack,
                        data_rate_ack,
                        channel_mask_ack,
                        "device rejected LinkADRReq"
                    );
                }
            }
            other => {
                debug!(dev_id = %session.dev_id, cid = other.cid(), "skipping MAC command");
            }
        }
    }
}

/// Fill the ADR part of a downlink paired with the last uplink.
///
/// Acts only while the device has an acknowledgment request pending, and
/// only recommends new settings once the history is full and the band and
/// desired data rate are known. Commands never ride on port 0.
pub async fn handle_downlink(
    store: &dyn DeviceStore,
    session: &mut SessionUpdate,
    response: &mut DataDownlink,
) -> Result<()> {
    if session.adr.pending {
        response.ack = true;

        if let Some(request) = link_adr_request(store, session).await? {
            response.f_opts.push(request);
            session.adr.expect_res = true;
        }
    }

    if !response.f_opts.is_empty() && response.f_port == Some(0) {
        response.f_port = Some(1);
    }

    Ok(())
}

async fn link_adr_request(
    store: &dyn DeviceStore,
    session: &mut SessionUpdate,
) -> Result<Option<MacCommand>> {
    let (band_name, desired_dr) = match (&session.adr.band, session.adr.data_rate) {
        (Some(band), Some(dr)) => (band.clone(), dr),
        _ => return Ok(None),
    };

    let frames = store.get_frames(&session.app_id, &session.dev_id).await?;
    if frames.len() < FRAME_HISTORY_LEN {
        return Ok(None);
    }

    let band = match region::band(&band_name) {
        Some(band) => band,
        None => {
            warn!(band = %band_name, "unknown band in session ADR state");
            return Ok(None);
        }
    };

    let tx_power = session
        .adr
        .tx_power
        .unwrap_or_else(|| band.default_tx_power());
    let history_snr = frames
        .iter()
        .map(|f| f.max_snr)
        .fold(f32::NEG_INFINITY, f32::max);

    let (new_dr, new_power) =
        match band.adr_settings(desired_dr, tx_power, history_snr, session.adr.margin) {
            Some(settings) => settings,
            // The band has no recommendation for this state; skip the cycle.
            None => return Ok(None),
        };

    let (dr_index, power_index) = match (
        band.data_rate_index(new_dr),
        band.tx_power_index(new_power),
    ) {
        (Some(dr), Some(power)) => (dr, power),
        _ => return Ok(None),
    };

    session.adr.data_rate = Some(new_dr);
    session.adr.tx_power = Some(new_power);
    session.adr.nb_trans = Some(1);

    debug!(
        dev_id = %session.dev_id,
        ?new_dr,
        new_power,
        "recommending ADR settings"
    );

    Ok(Some(MacCommand::LinkADRReq {
        data_rate: dr_index,
        tx_power: power_index,
        ch_mask: region::channel_mask(band.uplink_channels()),
        ch_mask_cntl: 0,
        nb_trans: 1,
    }))
}
