//! LoRaWAN protocol implementation
//!
//! This module contains the protocol-layer pieces of the core:
//! - MAC frame codec
//! - MAC command codec
//! - Regional band plans

/// MAC command codec
pub mod commands;

/// MAC frame codec
pub mod mac;

/// Regional band plans
pub mod region;

pub use mac::{DataPayload, PhyPayload};
pub use region::{BandPlan, DataRate};
