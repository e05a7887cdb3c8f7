//! Regional band plans
//!
//! The core treats regional parameters as a lookup service behind the
//! [`BandPlan`] trait: channel tables, data-rate and tx-power indices, RX2
//! defaults and the ADR recommendation function. Shipped plans: US915,
//! EU868 and AU915.

use serde::{Deserialize, Serialize};

/// Data rate identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataRate {
    /// SF12 / 125 kHz
    SF12BW125,
    /// SF11 / 125 kHz
    SF11BW125,
    /// SF10 / 125 kHz
    SF10BW125,
    /// SF9 / 125 kHz
    SF9BW125,
    /// SF8 / 125 kHz
    SF8BW125,
    /// SF7 / 125 kHz
    SF7BW125,
    /// SF7 / 250 kHz
    SF7BW250,
    /// SF8 / 500 kHz
    SF8BW500,
    /// SF12 / 500 kHz
    SF12BW500,
}

impl DataRate {
    /// Get spreading factor
    pub fn spreading_factor(&self) -> u8 {
        match self {
            DataRate::SF12BW125 | DataRate::SF12BW500 => 12,
            DataRate::SF11BW125 => 11,
            DataRate::SF10BW125 => 10,
            DataRate::SF9BW125 => 9,
            DataRate::SF8BW125 | DataRate::SF8BW500 => 8,
            DataRate::SF7BW125 | DataRate::SF7BW250 => 7,
        }
    }

    /// Get bandwidth in Hz
    pub fn bandwidth(&self) -> u32 {
        match self {
            DataRate::SF7BW250 => 250_000,
            DataRate::SF8BW500 | DataRate::SF12BW500 => 500_000,
            _ => 125_000,
        }
    }

    /// Demodulation floor in dB: the weakest SNR at which this rate still
    /// demodulates. Rates without an entry yield `None`.
    pub fn demodulation_floor(&self) -> Option<f32> {
        Some(match self.spreading_factor() {
            7 => -7.5,
            8 => -10.0,
            9 => -12.5,
            10 => -15.0,
            11 => -17.5,
            12 => -20.0,
            _ => return None,
        })
    }
}

/// Uplink channel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Channel frequency in Hz
    pub frequency: u32,
    /// Minimum data rate
    pub min_dr: DataRate,
    /// Maximum data rate
    pub max_dr: DataRate,
    /// Whether the channel is enabled
    pub enabled: bool,
}

/// RX2 window parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rx2Settings {
    /// RX2 frequency in Hz
    pub frequency: u32,
    /// RX2 data rate
    pub data_rate: DataRate,
}

/// Regional parameter provider.
///
/// `adr_settings` is the closed-loop recommendation: given the desired data
/// rate, current tx power and the link budget observed over the ADR history,
/// it returns the rate/power the device should move to, or `None` when no
/// recommendation can be computed for the current state.
pub trait BandPlan {
    /// Band identifier, e.g. `"US_902_928"`
    fn name(&self) -> &'static str;

    /// Ascending data-rate ladder the ADR algorithm may climb
    fn adr_data_rates(&self) -> &[DataRate];

    /// Usable tx powers in dBm, strongest first
    fn tx_powers(&self) -> &[i32];

    /// Default tx power in dBm
    fn default_tx_power(&self) -> i32 {
        self.tx_powers()[0]
    }

    /// Uplink channel table
    fn uplink_channels(&self) -> &[Channel];

    /// RX2 window defaults
    fn rx2(&self) -> Rx2Settings;

    /// RX2 override applied when an expected ADR acknowledgment is missing.
    ///
    /// Regional hook; plans without the quirk return `None`.
    fn rx2_when_adr_unanswered(&self) -> Option<Rx2Settings> {
        None
    }

    /// Index of a data rate in the band's data-rate table
    fn data_rate_index(&self, data_rate: DataRate) -> Option<u8>;

    /// Index of a tx power in the band's power table
    fn tx_power_index(&self, power: i32) -> Option<u8> {
        self.tx_powers()
            .iter()
            .position(|&p| p == power)
            .map(|i| i as u8)
    }

    /// Recommend a data rate and tx power for the observed link budget.
    ///
    /// `max_snr` is the best SNR across the ADR history; `margin` the
    /// installation margin in dB. Each 3 dB of headroom buys one step: first
    /// up the data-rate ladder, then down the power table. Negative headroom
    /// walks the power back up.
    fn adr_settings(
        &self,
        data_rate: DataRate,
        tx_power: i32,
        max_snr: f32,
        margin: f32,
    ) -> Option<(DataRate, i32)> {
        let floor = data_rate.demodulation_floor()?;
        let ladder = self.adr_data_rates();
        let powers = self.tx_powers();
        let mut dr_idx = ladder.iter().position(|&d| d == data_rate)?;
        let mut p_idx = powers
            .iter()
            .position(|&p| p <= tx_power)
            .unwrap_or(powers.len() - 1);

        let mut steps = ((max_snr - floor - margin) / 3.0) as i32;
        while steps > 0 {
            if dr_idx + 1 < ladder.len() {
                dr_idx += 1;
            } else if p_idx + 1 < powers.len() {
                p_idx += 1;
            } else {
                break;
            }
            steps -= 1;
        }
        while steps < 0 && p_idx > 0 {
            p_idx -= 1;
            steps += 1;
        }

        Some((ladder[dr_idx], powers[p_idx]))
    }
}

/// Bitmask of the enabled channels among the first sixteen of a table
pub fn channel_mask(channels: &[Channel]) -> u16 {
    let mut mask = 0u16;
    for (i, channel) in channels.iter().take(16).enumerate() {
        if channel.enabled {
            mask |= 1 << i;
        }
    }
    mask
}

/// Look up a shipped band plan by name
pub fn band(name: &str) -> Option<Box<dyn BandPlan + Send + Sync>> {
    match name {
        US915::NAME => Some(Box::new(US915::new())),
        EU868::NAME => Some(Box::new(EU868::new())),
        AU915::NAME => Some(Box::new(AU915::new())),
        _ => None,
    }
}

const US915_ADR_RATES: [DataRate; 4] = [
    DataRate::SF10BW125,
    DataRate::SF9BW125,
    DataRate::SF8BW125,
    DataRate::SF7BW125,
];
const US915_POWERS: [i32; 11] = [30, 28, 26, 24, 22, 20, 18, 16, 14, 12, 10];

/// US 902-928 MHz region configuration
#[derive(Debug)]
pub struct US915 {
    channels: Vec<Channel>,
}

impl US915 {
    /// Band identifier
    pub const NAME: &'static str = "US_902_928";

    /// Create the US915 plan with all 72 upstream channels enabled
    pub fn new() -> Self {
        Self {
            channels: upstream_64_8(902_300_000, 903_000_000),
        }
    }

    /// Enable only the channels of one sub-band (0-7)
    pub fn set_sub_band(&mut self, sub_band: u8) {
        set_sub_band(&mut self.channels, sub_band);
    }
}

impl Default for US915 {
    fn default() -> Self {
        Self::new()
    }
}

impl BandPlan for US915 {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn adr_data_rates(&self) -> &[DataRate] {
        &US915_ADR_RATES
    }

    fn tx_powers(&self) -> &[i32] {
        &US915_POWERS
    }

    fn default_tx_power(&self) -> i32 {
        20
    }

    fn uplink_channels(&self) -> &[Channel] {
        &self.channels
    }

    fn rx2(&self) -> Rx2Settings {
        Rx2Settings {
            frequency: 923_300_000,
            data_rate: DataRate::SF12BW500,
        }
    }

    fn data_rate_index(&self, data_rate: DataRate) -> Option<u8> {
        Some(match data_rate {
            DataRate::SF10BW125 => 0,
            DataRate::SF9BW125 => 1,
            DataRate::SF8BW125 => 2,
            DataRate::SF7BW125 => 3,
            DataRate::SF8BW500 => 4,
            _ => return None,
        })
    }
}

const EU868_ADR_RATES: [DataRate; 6] = [
    DataRate::SF12BW125,
    DataRate::SF11BW125,
    DataRate::SF10BW125,
    DataRate::SF9BW125,
    DataRate::SF8BW125,
    DataRate::SF7BW125,
];
const EU868_POWERS: [i32; 8] = [16, 14, 12, 10, 8, 6, 4, 2];

/// EU 863-870 MHz region configuration
#[derive(Debug)]
pub struct EU868 {
    channels: Vec<Channel>,
}

impl EU868 {
    /// Band identifier
    pub const NAME: &'static str = "EU_863_870";

    /// Create the EU868 plan with the three default channels
    pub fn new() -> Self {
        let channels = [868_100_000u32, 868_300_000, 868_500_000]
            .iter()
            .map(|&frequency| Channel {
                frequency,
                min_dr: DataRate::SF12BW125,
                max_dr: DataRate::SF7BW125,
                enabled: true,
            })
            .collect();
        Self { channels }
    }
}

impl Default for EU868 {
    fn default() -> Self {
        Self::new()
    }
}

impl BandPlan for EU868 {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn adr_data_rates(&self) -> &[DataRate] {
        &EU868_ADR_RATES
    }

    fn tx_powers(&self) -> &[i32] {
        &EU868_POWERS
    }

    fn default_tx_power(&self) -> i32 {
        14
    }

    fn uplink_channels(&self) -> &[Channel] {
        &self.channels
    }

    fn rx2(&self) -> Rx2Settings {
        Rx2Settings {
            frequency: 869_525_000,
            data_rate: DataRate::SF12BW125,
        }
    }

    fn data_rate_index(&self, data_rate: DataRate) -> Option<u8> {
        Some(match data_rate {
            DataRate::SF12BW125 => 0,
            DataRate::SF11BW125 => 1,
            DataRate::SF10BW125 => 2,
            DataRate::SF9BW125 => 3,
            DataRate::SF8BW125 => 4,
            DataRate::SF7BW125 => 5,
            DataRate::SF7BW250 => 6,
            _ => return None,
        })
    }
}

const AU915_ADR_RATES: [DataRate; 6] = [
    DataRate::SF12BW125,
    DataRate::SF11BW125,
    DataRate::SF10BW125,
    DataRate::SF9BW125,
    DataRate::SF8BW125,
    DataRate::SF7BW125,
];
const AU915_POWERS: [i32; 11] = [30, 28, 26, 24, 22, 20, 18, 16, 14, 12, 10];

/// AU 915-928 MHz region configuration
#[derive(Debug)]
pub struct AU915 {
    channels: Vec<Channel>,
}

impl AU915 {
    /// Band identifier
    pub const NAME: &'static str = "AU_915_928";

    /// Create the AU915 plan with all 72 upstream channels enabled
    pub fn new() -> Self {
        Self {
            channels: upstream_64_8(915_200_000, 915_900_000),
        }
    }

    /// Enable only the channels of one sub-band (0-7)
    pub fn set_sub_band(&mut self, sub_band: u8) {
        set_sub_band(&mut self.channels, sub_band);
    }
}

impl Default for AU915 {
    fn default() -> Self {
        Self::new()
    }
}

impl BandPlan for AU915 {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn adr_data_rates(&self) -> &[DataRate] {
        &AU915_ADR_RATES
    }

    fn tx_powers(&self) -> &[i32] {
        &AU915_POWERS
    }

    fn default_tx_power(&self) -> i32 {
        20
    }

    fn uplink_channels(&self) -> &[Channel] {
        &self.channels
    }

    fn rx2(&self) -> Rx2Settings {
        Rx2Settings {
            frequency: 923_300_000,
            data_rate: DataRate::SF12BW500,
        }
    }

    // Devices on this band fall back to RX2 when an ADR exchange stalls.
    fn rx2_when_adr_unanswered(&self) -> Option<Rx2Settings> {
        Some(self.rx2())
    }

    fn data_rate_index(&self, data_rate: DataRate) -> Option<u8> {
        Some(match data_rate {
            DataRate::SF12BW125 => 0,
            DataRate::SF11BW125 => 1,
            DataRate::SF10BW125 => 2,
            DataRate::SF9BW125 => 3,
            DataRate::SF8BW125 => 4,
            DataRate::SF7BW125 => 5,
            DataRate::SF8BW500 => 6,
            _ => return None,
        })
    }
}

// 64 narrow upstream channels at 200 kHz spacing plus 8 wide ones at
// 1.6 MHz spacing, the layout US915 and AU915 share.
fn upstream_64_8(narrow_base: u32, wide_base: u32) -> Vec<Channel> {
    let mut channels = Vec::with_capacity(72);
    for i in 0..64u32 {
        channels.push(Channel {
            frequency: narrow_base + i * 200_000,
            min_dr: DataRate::SF10BW125,
            max_dr: DataRate::SF7BW125,
            enabled: true,
        });
    }
    for i in 0..8u32 {
        channels.push(Channel {
            frequency: wide_base + i * 1_600_000,
            min_dr: DataRate::SF8BW500,
            max_dr: DataRate::SF8BW500,
            enabled: true,
        });
    }
    channels
}

fn set_sub_band(channels: &mut [Channel], sub_band: u8) {
    let sub_band = usize::from(sub_band.min(7));
    for (i, channel) in channels.iter_mut().enumerate() {
        channel.enabled = if i < 64 {
            i / 8 == sub_band
        } else {
            i - 64 == sub_band
        };
    }
}
