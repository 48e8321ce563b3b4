//! Outbound URL vetting. The agent-reachable fetch tools must not become
//! an SSRF bridge into loopback, private, link-local or cloud metadata
//! address space.

use std::net::IpAddr;
use url::Url;

/// Parse and vet a URL before an outbound fetch.
///
/// Blocks:
/// - non-http(s) schemes
/// - loopback (127.0.0.0/8, ::1)
/// - RFC 1918 private ranges (10/8, 172.16/12, 192.168/16)
/// - link-local (169.254.0.0/16 including the 169.254.169.254 metadata
///   endpoint, fe80::/10)
/// - unique-local (fc00::/7), broadcast, 0.0.0.0/8 and unspecified
///
/// Hostnames are resolved and every returned address is checked.
/// Unresolvable names pass through; they fail at fetch time anyway.
pub fn validate_fetch_url(url_str: &str) -> Result<Url, String> {
    let parsed = Url::parse(url_str).map_err(|e| format!("Invalid URL: {e}"))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(format!("Unsupported URL scheme '{}'", parsed.scheme()));
    }

    match parsed.host() {
        None => return Err("URL has no host".to_string()),
        Some(url::Host::Ipv4(v4)) => check_ip(IpAddr::V4(v4))?,
        Some(url::Host::Ipv6(v6)) => check_ip(IpAddr::V6(v6))?,
        Some(url::Host::Domain(domain)) => {
            if let Ok(addrs) = std::net::ToSocketAddrs::to_socket_addrs(&(domain, 80)) {
                for addr in addrs {
                    check_ip(addr.ip())?;
                }
            }
        }
    }

    Ok(parsed)
}

fn check_ip(ip: IpAddr) -> Result<(), String> {
    let blocked = match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || v4.octets()[0] == 0
        }
        IpAddr::V6(v6) => {
            // IPv4-mapped addresses (::ffff:127.0.0.1 and friends) are
            // judged as their embedded IPv4 address.
            if let Some(v4) = v6.to_ipv4_mapped() {
                return check_ip(IpAddr::V4(v4));
            }
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                || segments[0] & 0xffc0 == 0xfe80 // fe80::/10 link-local
                || segments[0] & 0xfe00 == 0xfc00 // fc00::/7 unique local
        }
    };
    if blocked {
        return Err(format!("Blocked: requests to {ip} are not allowed"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_urls_allowed() {
        assert!(validate_fetch_url("https://example.com").is_ok());
        assert!(validate_fetch_url("http://example.com/path?q=1").is_ok());
    }

    #[test]
    fn test_non_http_schemes_rejected() {
        assert!(validate_fetch_url("ftp://example.com").is_err());
        assert!(validate_fetch_url("file:///etc/passwd").is_err());
        assert!(validate_fetch_url("gopher://example.com").is_err());
    }

    #[test]
    fn test_loopback_blocked() {
        assert!(validate_fetch_url("http://127.0.0.1/admin").is_err());
        assert!(validate_fetch_url("http://127.0.0.2:8080").is_err());
        assert!(validate_fetch_url("http://localhost/secret").is_err());
        assert!(validate_fetch_url("http://[::1]:8080").is_err());
    }

    #[test]
    fn test_private_ranges_blocked() {
        assert!(validate_fetch_url("http://10.0.0.1").is_err());
        assert!(validate_fetch_url("http://172.16.0.1").is_err());
        assert!(validate_fetch_url("http://192.168.1.1").is_err());
    }

    #[test]
    fn test_metadata_endpoint_blocked() {
        assert!(validate_fetch_url("http://169.254.169.254/latest/meta-data/").is_err());
    }

    #[test]
    fn test_unspecified_and_zero_blocked() {
        assert!(validate_fetch_url("http://0.0.0.0").is_err());
        assert!(validate_fetch_url("http://[::]:8080").is_err());
    }

    #[test]
    fn test_ipv4_mapped_ipv6_blocked() {
        assert!(validate_fetch_url("http://[::ffff:127.0.0.1]/").is_err());
        assert!(validate_fetch_url("http://[::ffff:10.0.0.1]/").is_err());
    }

    #[test]
    fn test_ipv6_local_ranges_blocked() {
        assert!(validate_fetch_url("http://[fe80::1]/").is_err());
        assert!(validate_fetch_url("http://[fc00::1]/").is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(validate_fetch_url("not-a-url").is_err());
    }
}
