//! Input validation for cordon
//!
//! This module provides centralized validation for everything that crosses
//! into the allow-list or the generated ruleset. Entries that fail the
//! strict patterns are rejected, never coerced: the allow-list is populated
//! from untrusted remote data and a silently "repaired" entry would widen
//! the policy.

use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

/// Validates a strict dotted-quad IPv4 address.
///
/// Exactly four decimal octets separated by dots, each 0-255, no signs,
/// no whitespace, at most three digits per octet. Stricter than
/// `Ipv4Addr::from_str` on shape so that diagnostics name the offending
/// octet.
///
/// # Errors
///
/// Returns `Err` with a description of the first malformed octet.
pub fn validate_ipv4(input: &str) -> Result<Ipv4Addr, String> {
    let mut octets = [0u8; 4];
    let mut parts = input.split('.');

    for slot in &mut octets {
        let part = parts
            .next()
            .ok_or_else(|| format!("'{input}' is not a dotted-quad address"))?;

        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("'{input}' has a malformed octet '{part}'"));
        }

        let value: u16 = part
            .parse()
            .map_err(|_| format!("'{input}' has a malformed octet '{part}'"))?;
        if value > 255 {
            return Err(format!("octet '{part}' out of range in '{input}'"));
        }
        *slot = value as u8;
    }

    if parts.next().is_some() {
        return Err(format!("'{input}' has too many octets"));
    }

    Ok(Ipv4Addr::from(octets))
}

/// Validates an IPv4 address or CIDR block.
///
/// Accepts `a.b.c.d` (treated as /32) or `a.b.c.d/p` with `p` in 0..=32.
/// The returned network keeps the host bits the caller supplied;
/// canonicalization to the network address happens at insertion.
///
/// # Errors
///
/// Returns `Err` if the address part fails [`validate_ipv4`] or the
/// prefix is absent where a `/` is present, non-numeric, or above 32.
pub fn validate_ipv4_cidr(input: &str) -> Result<Ipv4Network, String> {
    let (addr_part, prefix) = match input.split_once('/') {
        Some((addr, prefix_part)) => {
            if prefix_part.is_empty()
                || prefix_part.len() > 2
                || !prefix_part.bytes().all(|b| b.is_ascii_digit())
            {
                return Err(format!("'{input}' has a malformed prefix length"));
            }
            let prefix: u8 = prefix_part
                .parse()
                .map_err(|_| format!("'{input}' has a malformed prefix length"))?;
            if prefix > 32 {
                return Err(format!("prefix /{prefix} out of range in '{input}'"));
            }
            (addr, prefix)
        }
        None => (input, 32),
    };

    let addr = validate_ipv4(addr_part)?;

    Ipv4Network::new(addr, prefix).map_err(|e| format!("'{input}' is not a valid network: {e}"))
}

/// Returns `true` when the entry is syntactically IPv6.
///
/// The policy is IPv4-only; callers use this to drop (not reject) IPv6
/// ranges coming from the metadata document.
pub fn is_ipv6_entry(input: &str) -> bool {
    input.contains(':')
}

/// Validates a service hostname.
///
/// Standard DNS shape: 1-253 bytes, dot-separated labels of 1-63 ASCII
/// alphanumerics or hyphens, no label starting or ending with a hyphen.
///
/// # Errors
///
/// Returns `Err` describing the violated constraint.
pub fn validate_hostname(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("hostname cannot be empty".to_string());
    }
    if name.len() > 253 {
        return Err(format!("hostname '{name}' too long (max 253 bytes)"));
    }

    for label in name.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(format!("hostname '{name}' has a malformed label '{label}'"));
        }
        if !label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-') {
            return Err(format!("hostname '{name}' has invalid characters in '{label}'"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!("hostname '{name}' has a hyphen-edged label '{label}'"));
        }
    }

    Ok(())
}

/// Validates a `host:port` probe target.
///
/// # Errors
///
/// Returns `Err` if the host part fails [`validate_hostname`] (or, for
/// literal addresses, [`validate_ipv4`]) or the port is absent/zero.
pub fn validate_probe_target(target: &str) -> Result<(), String> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| format!("probe target '{target}' must be host:port"))?;

    let port: u16 = port
        .parse()
        .map_err(|_| format!("probe target '{target}' has an invalid port"))?;
    if port == 0 {
        return Err(format!("probe target '{target}' has port 0"));
    }

    if validate_ipv4(host).is_ok() {
        return Ok(());
    }
    validate_hostname(host)
}
