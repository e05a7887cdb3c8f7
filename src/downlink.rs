//! Downlink option selection
//!
//! Every gateway that heard an uplink offers delivery options (RX1/RX2 on
//! its own radio). The selector orders the competing options and picks the
//! cheapest; the queue trait lets the application layer attach a payload to
//! the response within the configured wait.

use async_trait::async_trait;

use crate::message::DownlinkOption;

/// Pick the best delivery option: lowest score wins, ties resolve to the
/// earliest input position.
pub fn select_best(options: &[DownlinkOption]) -> Option<&DownlinkOption> {
    options
        .iter()
        .enumerate()
        .min_by_key(|(index, option)| (option.score, *index))
        .map(|(_, option)| option)
}

/// An application payload waiting to ride the next downlink
#[derive(Debug, Clone)]
pub struct QueuedDownlink {
    /// Destination port (1-223)
    pub f_port: u8,
    /// Application payload in the clear
    pub payload: Vec<u8>,
    /// Request a confirmed downlink
    pub confirmed: bool,
}

/// Source of queued application downlinks.
///
/// The resolver polls this (bounded by the configured downlink wait) before
/// answering an uplink, so a pending application message can ride along
/// instead of waiting for the device's next receive window.
#[async_trait]
pub trait DownlinkProvider: Send + Sync {
    /// Next queued downlink for the device, if any
    async fn next_downlink(&self, app_id: &str, dev_id: &str) -> Option<QueuedDownlink>;
}
