//! Runtime configuration
//!
//! This module contains the settings records the routing core is constructed
//! with:
//! - Deduplication windows and the downlink-response wait
//! - Network identity and the DevAddr prefix pool used during activation

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::device::DevAddrPrefix;

/// Deduplication and response timing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Collection window for data uplinks
    pub uplink_window: Duration,
    /// Collection window for activation requests
    pub activation_window: Duration,
    /// How long to wait for a queued application downlink before answering
    /// with a MAC-only frame
    pub downlink_wait: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            uplink_window: Duration::from_millis(300),
            activation_window: Duration::from_millis(1000),
            downlink_wait: Duration::from_millis(100),
        }
    }
}

/// One allocatable address prefix and the usage tags that select it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixConfig {
    /// The prefix
    pub prefix: DevAddrPrefix,
    /// Usage tags matched against a device's activation constraints
    pub tags: Vec<String>,
}

/// Network identity and activation parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// 3-byte network identifier
    pub net_id: [u8; 3],
    /// Address prefixes available for allocation
    pub prefixes: Vec<PrefixConfig>,
    /// RX1 data-rate offset offered in join-accepts
    pub rx1_dr_offset: u8,
    /// RX2 data-rate index offered in join-accepts
    pub rx2_data_rate: u8,
    /// RX delay in seconds offered in join-accepts
    pub rx_delay: u8,
    /// Optional channel-frequency list for join-accepts
    pub cf_list: Option<[u8; 16]>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        use crate::device::DevAddr;
        Self {
            net_id: [0x00, 0x00, 0x13],
            prefixes: vec![PrefixConfig {
                prefix: DevAddrPrefix::new(DevAddr::new([0x26, 0x00, 0x00, 0x00]), 7),
                tags: vec!["otaa".to_string(), "abp".to_string()],
            }],
            rx1_dr_offset: 0,
            rx2_data_rate: 0,
            rx_delay: 1,
            cf_list: None,
        }
    }
}
