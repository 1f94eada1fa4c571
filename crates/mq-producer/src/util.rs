// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stateless helpers: hex coding, client ids, client message ids, offset
//! message ids.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Uppercase hex encoding.
pub fn hex(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for byte in data {
        out.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        out.push(HEX_DIGITS[(byte & 0x0F) as usize] as char);
    }
    out
}

fn hex_char_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Decode a hex string (either case). `None` on odd length or bad digit.
pub fn hex_to_binary(hex: &str) -> Option<Vec<u8>> {
    let bytes = hex.as_bytes();
    if bytes.len() % 2 != 0 {
        return None;
    }
    bytes
        .chunks_exact(2)
        .map(|pair| Some(hex_char_value(pair[0])? << 4 | hex_char_value(pair[1])?))
        .collect()
}

// ============================================================================
// Client unique ids
// ============================================================================

/// Fixed part of every id created by this process: ip(4) + pid(2) + seed(4).
fn id_prefix() -> &'static str {
    static PREFIX: OnceLock<String> = OnceLock::new();
    PREFIX.get_or_init(|| {
        let ip = match local_ip_address::local_ip() {
            Ok(IpAddr::V4(v4)) => v4.octets(),
            Ok(IpAddr::V6(v6)) => {
                let o = v6.octets();
                [o[12], o[13], o[14], o[15]]
            }
            Err(e) => {
                log::debug!("[util] local ip unavailable ({}), using loopback", e);
                Ipv4Addr::LOCALHOST.octets()
            }
        };

        let mut prefix = Vec::with_capacity(10);
        prefix.extend_from_slice(&ip);
        prefix.extend_from_slice(&(std::process::id() as u16).to_be_bytes());
        prefix.extend_from_slice(&seed().to_be_bytes());
        hex(&prefix)
    })
}

/// Random per-process seed.
fn seed() -> u32 {
    fastrand::u32(..)
}

fn process_start_millis() -> u64 {
    static START: OnceLock<u64> = OnceLock::new();
    *START.get_or_init(now_millis)
}

/// Identity brokers use to push replies back to this client:
/// `ip@instance` or `ip@instance@unit`.
pub fn client_id(instance_name: &str, unit_name: Option<&str>) -> String {
    static CLIENT_IP: OnceLock<String> = OnceLock::new();
    let ip = CLIENT_IP.get_or_init(|| {
        local_ip_address::local_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_else(|_| Ipv4Addr::LOCALHOST.to_string())
    });
    match unit_name {
        Some(unit) => format!("{ip}@{instance_name}@{unit}"),
        None => format!("{ip}@{instance_name}"),
    }
}

/// Wall clock in milliseconds since the epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Create a 32-hex-char id unique across processes and calls.
///
/// Layout: ip(4) pid(2) seed(4) | millis since process start(4) counter(2).
pub fn create_uniq_id() -> String {
    static COUNTER: AtomicU16 = AtomicU16::new(0);

    let elapsed = now_millis().saturating_sub(process_start_millis()) as u32;
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut tail = [0u8; 6];
    tail[..4].copy_from_slice(&elapsed.to_be_bytes());
    tail[4..].copy_from_slice(&counter.to_be_bytes());

    let mut id = String::with_capacity(32);
    id.push_str(id_prefix());
    id.push_str(&hex(&tail));
    id
}

// ============================================================================
// Offset message ids
// ============================================================================

/// Store address + commit log offset carried in a broker message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageId {
    pub address: SocketAddr,
    pub offset: i64,
}

/// Build the broker-style message id for an address and commit log offset.
pub fn create_message_id(address: SocketAddr, offset: i64) -> String {
    let mut raw = Vec::with_capacity(28);
    match address.ip() {
        IpAddr::V4(v4) => raw.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => raw.extend_from_slice(&v6.octets()),
    }
    raw.extend_from_slice(&(address.port() as i32).to_be_bytes());
    raw.extend_from_slice(&offset.to_be_bytes());
    hex(&raw)
}

/// Decode an offset message id (IPv4: 32 hex chars, IPv6: 56 hex chars).
pub fn decode_message_id(msg_id: &str) -> Option<MessageId> {
    let raw = hex_to_binary(msg_id)?;
    let ip_len = match raw.len() {
        16 => 4,
        28 => 16,
        _ => return None,
    };

    let ip = if ip_len == 4 {
        IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))
    } else {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&raw[..16]);
        IpAddr::V6(Ipv6Addr::from(octets))
    };

    let port = i32::from_be_bytes(raw[ip_len..ip_len + 4].try_into().ok()?);
    let offset = i64::from_be_bytes(raw[ip_len + 4..ip_len + 12].try_into().ok()?);

    Some(MessageId {
        address: SocketAddr::new(ip, u16::try_from(port).ok()?),
        offset,
    })
}
