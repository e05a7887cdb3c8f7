//! Frame-counter resolution and replay policy
//!
//! LoRaWAN transmits only the 16 low bits of the 32-bit frame counter. The
//! resolver reconstructs the full value against the last counter the server
//! stored, and the policy check enforces monotonicity with a bounded forward
//! gap.

use crate::error::{Result, RoutingError};

/// Largest accepted forward jump between two consecutive uplinks.
pub const MAX_FCNT_GAP: u32 = 16_384;

/// Resolve the full 32-bit counter for an observed 16-bit LSB.
///
/// Keeps the rollover window of `stored_full` when the observed LSB has not
/// moved backwards; otherwise the counter is assumed to have wrapped into the
/// next window. The result never resolves below `stored_full`'s window and is
/// always within one 65536-wide window of it.
pub fn resolve_full(stored_full: u32, observed_lsb: u16) -> u32 {
    let window = stored_full & 0xFFFF_0000;
    if observed_lsb < stored_full as u16 {
        window.wrapping_add(0x1_0000) | u32::from(observed_lsb)
    } else {
        window | u32::from(observed_lsb)
    }
}

/// Validate a resolved counter against the stored one.
///
/// With `check_disabled` the counter is accepted unconditionally. Otherwise a
/// counter below the stored value is a replay, and a forward gap above
/// [`MAX_FCNT_GAP`] indicates a desynchronized or replayed device.
pub fn validate(stored_full: u32, resolved: u32, check_disabled: bool) -> Result<()> {
    if check_disabled {
        return Ok(());
    }
    if resolved < stored_full {
        return Err(RoutingError::InvalidFrameCounter);
    }
    if resolved - stored_full > MAX_FCNT_GAP {
        return Err(RoutingError::InvalidFrameCounter);
    }
    Ok(())
}
