//! Uplink resolution pipeline
//!
//! One pass per deduplicated uplink: parse the representative payload, find
//! the device by trial MIC validation over the candidate sessions sharing
//! the address, resolve the full frame counter, aggregate gateway metadata
//! across the duplicate set, run the ADR/MAC pipeline against the chosen
//! response option, and persist the session with a change-tracked diff.
//!
//! Validation failures abort before any stored state is mutated; a
//! persistence failure after successful protocol processing is surfaced to
//! the caller and logged, with no automatic retry.

use std::sync::Arc;
use std::time::SystemTime;

use tokio::time::timeout;
use tracing::{debug, error};

use crate::adr;
use crate::config::TimingConfig;
use crate::crypto::{self, Direction};
use crate::dedup::Deduplicator;
use crate::device::SessionUpdate;
use crate::downlink::{self, DownlinkProvider};
use crate::error::{Result, RoutingError};
use crate::fcnt;
use crate::lorawan::commands::{self, MacCommand};
use crate::lorawan::mac::{self, DataDownlink, MType, PhyPayload};
use crate::lorawan::region;
use crate::message::{DownlinkMessage, UplinkMessage};
use crate::store::DeviceStore;

/// Resolves deduplicated uplinks to device sessions
pub struct UplinkResolver {
    store: Arc<dyn DeviceStore>,
    dedup: Deduplicator<UplinkMessage>,
    timing: TimingConfig,
    downlinks: Option<Arc<dyn DownlinkProvider>>,
}

impl UplinkResolver {
    /// Create a resolver on top of a session store
    pub fn new(store: Arc<dyn DeviceStore>, timing: TimingConfig) -> Self {
        Self {
            store,
            dedup: Deduplicator::new(timing.uplink_window),
            timing,
            downlinks: None,
        }
    }

    /// Attach a source of queued application downlinks
    pub fn with_downlink_provider(mut self, provider: Arc<dyn DownlinkProvider>) -> Self {
        self.downlinks = Some(provider);
        self
    }

    /// Process one gateway uplink.
    ///
    /// Contributors to an open collection return `Ok(None)`; the collector
    /// returns the resolved, enriched message.
    pub async fn handle_uplink(&self, uplink: UplinkMessage) -> Result<Option<UplinkMessage>> {
        let key = uplink.payload.clone();
        let duplicates = self.dedup.deduplicate(&key, uplink).await;
        if duplicates.is_empty() {
            return Ok(None);
        }
        self.resolve(duplicates).await.map(Some)
    }

    /// Boundary passthrough for scheduled downlinks.
    pub async fn handle_downlink(&self, message: DownlinkMessage) -> Result<DownlinkMessage> {
        if message.option.is_none() {
            return Err(RoutingError::invalid("downlink has no delivery option"));
        }
        debug!(bytes = message.payload.len(), "forwarding downlink");
        Ok(message)
    }

    async fn resolve(&self, mut duplicates: Vec<UplinkMessage>) -> Result<UplinkMessage> {
        // The first duplicate is the representative; the rest only
        // contribute gateway metadata and delivery options.
        let mut message = duplicates.remove(0);
        for duplicate in duplicates {
            message.gateways.extend(duplicate.gateways);
            message.downlink_options.extend(duplicate.downlink_options);
        }

        let data = match mac::parse(&message.payload)? {
            PhyPayload::Data(data)
                if matches!(
                    data.mtype,
                    MType::UnconfirmedDataUp | MType::ConfirmedDataUp
                ) =>
            {
                data
            }
            _ => return Err(RoutingError::invalid("expected a data uplink")),
        };
        let dev_addr = data.fhdr.dev_addr;
        let observed_lsb = data.fhdr.f_cnt;

        let candidates = self
            .store
            .list_for_address(dev_addr, Some(observed_lsb))
            .await?;
        if candidates.is_empty() {
            return Err(RoutingError::NotFound);
        }

        // Trial MIC validation: first candidate in store order wins.
        let mut selected = None;
        for candidate in candidates {
            let full_fcnt = if candidate.options.uses_32bit_fcnt {
                fcnt::resolve_full(candidate.fcnt_up, observed_lsb)
            } else {
                u32::from(observed_lsb)
            };
            if mac::validate_data_mic(
                &message.payload,
                &candidate.nwk_skey,
                dev_addr,
                full_fcnt,
                Direction::Up,
            ) {
                selected = Some((candidate, full_fcnt));
                break;
            }
        }
        let (session, full_fcnt) = selected.ok_or(RoutingError::NoMatch)?;
        fcnt::validate(
            session.fcnt_up,
            full_fcnt,
            session.options.disable_fcnt_check,
        )?;

        debug!(
            app_id = %session.app_id,
            dev_id = %session.dev_id,
            ?dev_addr,
            fcnt = full_fcnt,
            gateways = message.gateways.len(),
            "resolved uplink"
        );

        let mut update = SessionUpdate::start(session);
        update.fcnt_up = full_fcnt;
        update.last_seen = Some(SystemTime::now());

        let mut uplink_commands = commands::parse_all(&data.fhdr.f_opts, Direction::Up)?;
        if data.f_port == Some(0) && !data.frm_payload.is_empty() {
            // Port 0 carries MAC commands encrypted with the network key.
            let plain = crypto::encrypt_payload(
                &update.nwk_skey,
                dev_addr,
                full_fcnt,
                Direction::Up,
                &data.frm_payload,
            );
            uplink_commands.extend(commands::parse_all(&plain, Direction::Up)?);
        }

        let mut best_option = downlink::select_best(&message.downlink_options).cloned();
        let mut response_frame = match best_option {
            Some(_) => {
                let mut frame = DataDownlink::new(dev_addr, update.fcnt_down);
                frame.ack = data.mtype == MType::ConfirmedDataUp;
                if let Some(provider) = &self.downlinks {
                    let next = provider.next_downlink(&update.app_id, &update.dev_id);
                    if let Ok(Some(queued)) = timeout(self.timing.downlink_wait, next).await {
                        frame.f_port = Some(queued.f_port);
                        frame.frm_payload = queued.payload;
                        frame.confirmed = queued.confirmed;
                    }
                }
                Some(frame)
            }
            None => None,
        };

        let answer_expected = update.adr.expect_res;
        adr::handle_uplink(self.store.as_ref(), &mut update, &message, &data).await?;
        adr::process_commands(
            &mut update,
            &message,
            &uplink_commands,
            response_frame.as_mut(),
        );
        if let Some(frame) = response_frame.as_mut() {
            adr::handle_downlink(self.store.as_ref(), &mut update, frame).await?;
        }

        // Regional hook: some bands fall back to RX2 while a LinkADRAns is
        // outstanding.
        let answered = uplink_commands
            .iter()
            .any(|c| matches!(c, MacCommand::LinkADRAns { .. }));
        if answer_expected && !answered {
            if let Some(rx2) = update
                .adr
                .band
                .as_deref()
                .and_then(region::band)
                .and_then(|band| band.rx2_when_adr_unanswered())
            {
                if let Some(option) = best_option.as_mut() {
                    debug!(dev_id = %update.dev_id, "forcing RX2; ADR answer outstanding");
                    option.protocol_config.data_rate = rx2.data_rate;
                    option.gateway_config.frequency = rx2.frequency;
                }
            }
        }

        message.response_template = match (best_option, response_frame) {
            (Some(option), Some(frame)) => {
                let payload = if frame.is_empty() {
                    Vec::new()
                } else {
                    // The sealed frame consumes a downlink counter; the
                    // increment rides the same persistence write as the MIC
                    // it is baked into.
                    update.fcnt_down = update.fcnt_down.wrapping_add(1);
                    frame.serialize(&update.nwk_skey, &update.app_skey)?
                };
                Some(DownlinkMessage {
                    payload,
                    option: Some(option),
                    frame: Some(frame),
                })
            }
            _ => None,
        };

        message.app_id = Some(update.app_id.clone());
        message.dev_id = Some(update.dev_id.clone());

        let (session, changed) = update.into_parts();
        if let Err(err) = self.store.set(&session, &changed).await {
            error!(
                app_id = %session.app_id,
                dev_id = %session.dev_id,
                %err,
                "failed to persist session after uplink"
            );
            return Err(err);
        }

        Ok(message)
    }
}
