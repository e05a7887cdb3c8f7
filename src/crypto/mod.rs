//! LoRaWAN cryptographic operations
//!
//! This module provides the cryptographic functions the server side of the
//! protocol needs:
//! - Message Integrity Code (MIC) computation for data and join frames
//! - Payload encryption/decryption
//! - Join-accept encryption
//! - Session key derivation
//!
//! MICs are AES-CMAC truncated to four bytes; key derivation and the
//! join-accept wrapping are raw AES-128 block operations.

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};
use heapless::Vec;

use crate::device::{AESKey, DevAddr};

/// MIC size in bytes
pub const MIC_SIZE: usize = 4;

/// Block size for AES-128
const BLOCK_SIZE: usize = 16;

/// Direction identifiers for cryptographic operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Uplink (device to network)
    Up = 0,
    /// Downlink (network to device)
    Down = 1,
}

fn cmac_trunc(key: &AESKey, parts: &[&[u8]]) -> [u8; MIC_SIZE] {
    // Key length is fixed at 16 bytes, so construction cannot fail.
    let mut mac =
        <Cmac<Aes128> as Mac>::new_from_slice(key.as_bytes()).unwrap_or_else(|_| unreachable!());
    for part in parts {
        mac.update(part);
    }
    let tag = mac.finalize().into_bytes();
    let mut mic = [0u8; MIC_SIZE];
    mic.copy_from_slice(&tag[..MIC_SIZE]);
    mic
}

/// Compute the MIC for a LoRaWAN data frame
///
/// `data` is the serialized frame from the MHDR up to (not including) the
/// MIC. The full 32-bit frame counter enters through the B0 block even
/// though only its low 16 bits travel on the wire.
pub fn compute_mic(
    key: &AESKey,
    data: &[u8],
    dev_addr: DevAddr,
    fcnt: u32,
    dir: Direction,
) -> [u8; MIC_SIZE] {
    let mut b0 = [0u8; BLOCK_SIZE];
    b0[0] = 0x49; // MIC block identifier
    b0[5] = dir as u8;
    b0[6..10].copy_from_slice(&dev_addr.to_wire());
    b0[10..14].copy_from_slice(&fcnt.to_le_bytes());
    b0[15] = data.len() as u8;
    cmac_trunc(key, &[&b0, data])
}

/// Compute the MIC for a join-request or join-accept frame
///
/// `data` is the serialized frame from the MHDR up to the MIC; join MICs
/// have no B0 block.
pub fn compute_join_mic(key: &AESKey, data: &[u8]) -> [u8; MIC_SIZE] {
    cmac_trunc(key, &[data])
}

/// Encrypt or decrypt an application payload (AES-128 counter mode)
///
/// The operation is an involution: applying it twice with the same
/// parameters restores the input.
pub fn encrypt_payload(
    key: &AESKey,
    dev_addr: DevAddr,
    fcnt: u32,
    dir: Direction,
    payload: &[u8],
) -> Vec<u8, 256> {
    let cipher =
        Aes128::new_from_slice(key.as_bytes()).unwrap_or_else(|_| unreachable!());
    let mut result = Vec::new();

    let blocks = (payload.len() + BLOCK_SIZE - 1) / BLOCK_SIZE;
    for i in 0..blocks {
        let mut a = [0u8; BLOCK_SIZE];
        a[0] = 0x01; // data-encryption block identifier
        a[5] = dir as u8;
        a[6..10].copy_from_slice(&dev_addr.to_wire());
        a[10..14].copy_from_slice(&fcnt.to_le_bytes());
        a[15] = (i + 1) as u8;

        let mut s = a;
        cipher.encrypt_block((&mut s).into());

        let start = i * BLOCK_SIZE;
        let end = (start + BLOCK_SIZE).min(payload.len());
        for j in start..end {
            let _ = result.push(payload[j] ^ s[j - start]);
        }
    }

    result
}

/// Encrypt a join-accept body for transmission
///
/// The network applies the AES *decrypt* primitive so that devices, which
/// only carry the encrypt path, recover the plaintext by encrypting.
/// `data` is everything after the MHDR, MIC included.
pub fn encrypt_join_accept(key: &AESKey, data: &[u8]) -> Vec<u8, 256> {
    let cipher =
        Aes128::new_from_slice(key.as_bytes()).unwrap_or_else(|_| unreachable!());
    let mut result = Vec::new();

    for chunk in data.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        cipher.decrypt_block((&mut block).into());
        for &b in &block[..chunk.len()] {
            let _ = result.push(b);
        }
    }

    result
}

/// Reverse [`encrypt_join_accept`] (the device-side operation)
pub fn decrypt_join_accept(key: &AESKey, data: &[u8]) -> Vec<u8, 256> {
    let cipher =
        Aes128::new_from_slice(key.as_bytes()).unwrap_or_else(|_| unreachable!());
    let mut result = Vec::new();

    for chunk in data.chunks(BLOCK_SIZE) {
        let mut block = [0u8; BLOCK_SIZE];
        block[..chunk.len()].copy_from_slice(chunk);
        cipher.encrypt_block((&mut block).into());
        for &b in &block[..chunk.len()] {
            let _ = result.push(b);
        }
    }

    result
}

/// Derive the network and application session keys for a join
///
/// LoRaWAN 1.0.x: `NwkSKey = aes128(AppKey, 0x01 | AppNonce | NetID |
/// DevNonce | pad)`, `AppSKey` the same with `0x02`.
pub fn derive_session_keys(
    app_key: &AESKey,
    app_nonce: &[u8; 3],
    net_id: &[u8; 3],
    dev_nonce: u16,
) -> (AESKey, AESKey) {
    let cipher =
        Aes128::new_from_slice(app_key.as_bytes()).unwrap_or_else(|_| unreachable!());

    let mut nwk_skey = [0u8; BLOCK_SIZE];
    nwk_skey[0] = 0x01;
    nwk_skey[1..4].copy_from_slice(app_nonce);
    nwk_skey[4..7].copy_from_slice(net_id);
    nwk_skey[7..9].copy_from_slice(&dev_nonce.to_le_bytes());
    cipher.encrypt_block((&mut nwk_skey).into());

    let mut app_skey = [0u8; BLOCK_SIZE];
    app_skey[0] = 0x02;
    app_skey[1..4].copy_from_slice(app_nonce);
    app_skey[4..7].copy_from_slice(net_id);
    app_skey[7..9].copy_from_slice(&dev_nonce.to_le_bytes());
    cipher.encrypt_block((&mut app_skey).into());

    (AESKey::new(nwk_skey), AESKey::new(app_skey))
}
