//! Shape validation for client IP strings
//!
//! This is a shape check, not an address parser: IPv4 octets are not
//! range-checked and IPv6 must be written out as eight hextets unless
//! compressed forms are explicitly allowed.

use once_cell::sync::Lazy;
use regex::Regex;
use std::net::Ipv6Addr;

/// Sentinel reported when no lookup produced an address
pub const UNKNOWN_IP: &str = "unknown";

static IPV4_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]{1,3}\.){3}[0-9]{1,3}$").unwrap());

static IPV6_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9a-fA-F]{1,4}:){7}[0-9a-fA-F]{1,4}$").unwrap());

/// Artifacts of stringified async values or arrays
const REJECTED_FRAGMENTS: [&str; 4] = ["Promise", "object", "[", "]"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpValidator {
    allow_compressed_ipv6: bool,
}

impl IpValidator {
    pub fn strict() -> Self {
        Self::default()
    }

    /// Also accept `::`-compressed and other RFC 4291 IPv6 spellings
    pub fn allowing_compressed_ipv6() -> Self {
        Self {
            allow_compressed_ipv6: true,
        }
    }

    pub fn new(allow_compressed_ipv6: bool) -> Self {
        Self {
            allow_compressed_ipv6,
        }
    }

    /// Whether `ip` may be stored in the session cache
    ///
    /// The `unknown` sentinel is cacheable.
    pub fn is_valid(&self, ip: &str) -> bool {
        if ip.is_empty() {
            return false;
        }
        if ip == UNKNOWN_IP {
            return true;
        }
        if REJECTED_FRAGMENTS.iter().any(|frag| ip.contains(frag)) {
            return false;
        }

        IPV4_SHAPE.is_match(ip)
            || IPV6_SHAPE.is_match(ip)
            || (self.allow_compressed_ipv6 && ip.parse::<Ipv6Addr>().is_ok())
    }

    /// Valid and an actual address rather than the sentinel
    pub fn is_usable(&self, ip: &str) -> bool {
        ip != UNKNOWN_IP && self.is_valid(ip)
    }
}

/// Strict shape check, see [`IpValidator::is_valid`]
pub fn is_valid_ip(ip: &str) -> bool {
    IpValidator::strict().is_valid(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dotted_quad_and_full_ipv6() {
        assert!(is_valid_ip("192.168.1.1"));
        assert!(is_valid_ip("1200:0000:AB00:1234:0000:2552:7777:1313"));
        assert!(is_valid_ip("fe80:0:0:0:202:b3ff:fe1e:8329"));
    }

    #[test]
    fn rejects_artifacts_and_empty() {
        assert!(!is_valid_ip("[object Promise]"));
        assert!(!is_valid_ip(""));
        assert!(!is_valid_ip("1.2.3.4,5.6.7.8"));
        assert!(!is_valid_ip("[1.2.3.4]"));
        assert!(!is_valid_ip("localhost"));
    }

    #[test]
    fn unknown_is_valid_but_not_usable() {
        assert!(is_valid_ip("unknown"));
        assert!(!IpValidator::strict().is_usable("unknown"));
        assert!(IpValidator::strict().is_usable("8.8.8.8"));
    }

    #[test]
    fn octet_ranges_are_not_checked() {
        assert!(is_valid_ip("999.999.999.999"));
        assert!(!is_valid_ip("1.2.3.4444"));
    }

    #[test]
    fn compressed_ipv6_needs_opt_in() {
        assert!(!is_valid_ip("2001:db8::1"));
        assert!(!is_valid_ip("::1"));
        assert!(IpValidator::allowing_compressed_ipv6().is_valid("2001:db8::1"));
        assert!(IpValidator::allowing_compressed_ipv6().is_valid("::1"));
        assert!(!IpValidator::allowing_compressed_ipv6().is_valid("2001:db8:::1"));
    }

    #[test]
    fn ascii_digits_only() {
        // Arabic-Indic digits would match a Unicode \d
        assert!(!is_valid_ip("١.١.١.١"));
    }
}
