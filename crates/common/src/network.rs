// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Tunnel Registry Contributors

// Network utility functions

use std::net::IpAddr;

use crate::error::{Error, Result};

/// Check if a host address is a loopback address
/// Supports IPv4 (127.0.0.1, 127.x.x.x), IPv6 (::1), and hostname (localhost)
pub fn is_loopback_address(host: &str) -> bool {
    // Handle "localhost" as special case
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    // Try parsing as IpAddr (handles "127.0.0.1", "::1", etc.)
    if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        return ip.is_loopback();
    }

    // Fail-safe: if we can't parse it, assume non-loopback for security
    false
}

/// Split a `host:port` (or `[v6]:port`) address into its parts
///
/// Returns `None` when either part is missing or the port is not a number.
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let addr = addr.trim();

    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        (host, tail.strip_prefix(':')?)
    } else {
        let (host, port) = addr.rsplit_once(':')?;
        // Bare IPv6 without brackets is ambiguous
        if host.contains(':') {
            return None;
        }
        (host, port)
    };

    if host.is_empty() {
        return None;
    }

    let port = port.parse::<u16>().ok()?;
    Some((host, port))
}

/// Validate a local forwarding target such as `localhost:8080`
pub fn validate_forward_target(addr: &str) -> Result<()> {
    match split_host_port(addr) {
        Some((_, 0)) => Err(Error::InvalidRequest(format!(
            "forwards_to '{}' must use a non-zero port",
            addr
        ))),
        Some(_) => Ok(()),
        None => Err(Error::InvalidRequest(format!(
            "forwards_to '{}' must be a host:port address",
            addr
        ))),
    }
}
