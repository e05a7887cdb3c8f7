//! LoRaWAN network-server core
//!
//! This crate implements the routing slice shared by the broker,
//! network-server and handler roles of a LoRaWAN backend:
//!
//! # Features
//! - Time-windowed multi-gateway deduplication of uplinks and join requests
//! - Device resolution by trial MIC validation over candidate sessions
//! - 16-to-32-bit frame-counter disambiguation with replay protection
//! - Adaptive Data Rate closed loop and MAC command processing
//! - Over-The-Air Activation with nonce bookkeeping and key derivation
//! - Regional band plans (US915, EU868, AU915) behind a provider trait
//!
//! Transport, broker fan-out, payload codecs and the persistence backend are
//! external collaborators; the crate defines their contracts and ships an
//! in-memory store for tests and single-node use.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use loranet::config::TimingConfig;
//! use loranet::store::MemoryStore;
//! use loranet::uplink::UplinkResolver;
//!
//! let store = Arc::new(MemoryStore::new());
//! let resolver = UplinkResolver::new(store, TimingConfig::default());
//! # drop(resolver);
//! ```

#![warn(missing_docs)]

/// Over-The-Air Activation coordination
pub mod activation;

/// Adaptive Data Rate control and MAC command processing
pub mod adr;

/// Runtime configuration
pub mod config;

/// Cryptographic functions
pub mod crypto;

/// Time-windowed message deduplication
pub mod dedup;

/// Device session model
pub mod device;

/// Downlink option selection
pub mod downlink;

/// Error taxonomy
pub mod error;

/// Frame-counter resolution
pub mod fcnt;

/// LoRaWAN protocol codecs and band plans
pub mod lorawan;

/// Wire-message records
pub mod message;

/// Transport-agnostic RPC boundary
pub mod rpc;

/// Device session store contract
pub mod store;

/// Uplink resolution pipeline
pub mod uplink;

pub use error::{Result, RoutingError};
