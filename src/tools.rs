// ABOUTME: Small network helpers for building RIST URLs
// ABOUTME: IPv4/IPv6 literal checks and rist:// / rist6:// URL construction

use crate::error::Error;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Whether `addr` is an IPv4 literal
pub fn is_ipv4(addr: &str) -> bool {
    addr.parse::<Ipv4Addr>().is_ok()
}

/// Whether `addr` is an IPv6 literal
pub fn is_ipv6(addr: &str) -> bool {
    addr.parse::<Ipv6Addr>().is_ok()
}

/// Build a RIST URL for `ip` and `port`
///
/// IPv4 gives `rist://ip:port`, IPv6 gives `rist6://[ip]:port`. With `listen` the
/// address is prefixed with `@`.
pub fn build_rist_url(ip: &str, port: &str, listen: bool) -> crate::Result<String> {
    let ipv6 = if is_ipv4(ip) {
        false
    } else if is_ipv6(ip) {
        true
    } else {
        log::error!("Provided IP-Address not valid: {}", ip);
        return Err(Error::InvalidAddress(ip.to_string()));
    };

    match port.trim().parse::<u16>() {
        Ok(p) if p > 0 => {}
        _ => {
            log::error!("Provided Port number not valid: {}", port);
            return Err(Error::InvalidPort(port.to_string()));
        }
    }

    let scheme = if ipv6 { "rist6://" } else { "rist://" };
    let at = if listen { "@" } else { "" };
    let host = if ipv6 {
        format!("[{}]", ip)
    } else {
        ip.to_string()
    };

    Ok(format!("{}{}{}:{}", scheme, at, host, port.trim()))
}
