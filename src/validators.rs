//! Input validation for configuration values
//!
//! Everything that ends up in `torrc` or on an iptables command line passes
//! through here first. Directive lines in particular must stay single-line:
//! a line break would let configuration smuggle extra directives, or a fake
//! marker line, into the managed block.

use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// # Errors
///
/// Returns `Err` if interface name is empty or violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Interface name cannot be empty".to_string());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    // ASCII alphanumeric only, plus dot, dash, underscore
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Validates a managed block tag (the `TAG` in `# BEGIN TAG`).
///
/// # Errors
///
/// Returns `Err` if the tag is empty, longer than 64 characters, or uses
/// anything but ASCII alphanumerics, dash, underscore and dot.
pub fn validate_tag(tag: &str) -> Result<String, String> {
    if tag.is_empty() {
        return Err("Block tag cannot be empty".to_string());
    }
    if tag.len() > 64 {
        return Err("Block tag too long (max 64 characters)".to_string());
    }
    if !tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err("Block tag contains invalid characters".to_string());
    }
    Ok(tag.to_string())
}

/// Validates one `Keyword value...` torrc directive.
///
/// # Errors
///
/// Returns `Err` for empty lines, comments, control characters (including
/// line breaks) and keywords that are not alphanumeric.
pub fn validate_directive(line: &str) -> Result<String, String> {
    if line.trim().is_empty() {
        return Err("Directive cannot be empty".to_string());
    }
    if line.len() > 1024 {
        return Err("Directive too long (max 1024 characters)".to_string());
    }
    if line.chars().any(char::is_control) {
        return Err("Directive contains control characters".to_string());
    }
    if line.starts_with(char::is_whitespace) {
        return Err("Directive cannot start with whitespace".to_string());
    }

    let keyword = line.split_whitespace().next().unwrap_or_default();
    if !keyword.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(format!("Invalid directive keyword '{keyword}'"));
    }
    Ok(line.to_string())
}

/// Validates the access point's IPv4 address.
///
/// # Errors
///
/// Returns `Err` if the value is not a unicast IPv4 address.
pub fn validate_ipv4(addr: &str) -> Result<Ipv4Addr, String> {
    let ip: Ipv4Addr = addr
        .parse()
        .map_err(|_| format!("'{addr}' is not an IPv4 address"))?;
    if ip.is_unspecified() || ip.is_broadcast() || ip.is_multicast() {
        return Err(format!("{ip} cannot be used as a listen address"));
    }
    Ok(ip)
}

/// Validates Tor's `VirtualAddrNetwork` range.
///
/// # Errors
///
/// Returns `Err` if the value is not IPv4 CIDR notation.
pub fn validate_network(cidr: &str) -> Result<Ipv4Network, String> {
    if !cidr.contains('/') {
        return Err(format!("'{cidr}' is missing a prefix length"));
    }
    cidr.parse::<Ipv4Network>()
        .map_err(|e| format!("'{cidr}' is not an IPv4 network: {e}"))
}

/// Validates a comma-separated `AutomapHostsSuffixes` list (`.onion,.exit`).
///
/// # Errors
///
/// Returns `Err` if the list is empty or an entry is not a dot-prefixed label.
pub fn validate_suffixes(list: &str) -> Result<String, String> {
    if list.is_empty() {
        return Err("Suffix list cannot be empty".to_string());
    }
    for suffix in list.split(',') {
        let Some(label) = suffix.strip_prefix('.') else {
            return Err(format!("Suffix '{suffix}' must start with '.'"));
        };
        if label.is_empty()
            || !label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.'))
        {
            return Err(format!("Invalid suffix '{suffix}'"));
        }
    }
    Ok(list.to_string())
}

/// Returns a warning if `net` is not a range reserved for private use.
///
/// Tor hands out addresses from this range for automapped hostnames; a public
/// range would shadow real hosts for every gateway client.
pub fn check_virtual_network(net: Ipv4Network) -> Option<String> {
    let ip = net.network();
    if ip.is_private() {
        return None;
    }
    // RFC 6598 shared address space
    if Ipv4Network::new(Ipv4Addr::new(100, 64, 0, 0), 10).is_ok_and(|cgn| cgn.contains(ip)) {
        return None;
    }
    Some(format!(
        "VirtualAddrNetwork {net} is not a private range; automapped addresses may shadow real hosts"
    ))
}

/// Returns a warning if the access point address is not private.
pub fn check_ap_address(ip: Ipv4Addr) -> Option<String> {
    if ip.is_loopback() {
        Some(format!("{ip} is loopback; gateway clients cannot reach it"))
    } else if ip.is_link_local() {
        Some(format!("{ip} is link-local"))
    } else if !ip.is_private() {
        Some(format!("{ip} is a public address; Tor will listen on it"))
    } else {
        None
    }
}
