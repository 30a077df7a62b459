//! URL sanitization for the shorten path.
//!
//! Rejects anything that could turn a redirect into an SSRF or script
//! vector: dangerous schemes, non-http(s) schemes, blocked hosts (exact or
//! parent domain), and private/link-local/loopback targets.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use url::Host;

const DANGEROUS_SCHEMES: &[&str] = &["javascript", "data", "vbscript", "file"];
const ALLOWED_SCHEMES: &[&str] = &["http", "https"];

pub const DEFAULT_MAX_URL_LENGTH: usize = 2048;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SanitizeError {
    #[error("url must not be empty")]
    EmptyUrl,
    #[error("url is {len} bytes, limit is {max}")]
    UrlTooLong { len: usize, max: usize },
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("scheme is not allowed: {0}")]
    InvalidScheme(String),
    #[error("dangerous scheme: {0}")]
    DangerousScheme(String),
    #[error("private or local address: {0}")]
    PrivateIp(String),
    #[error("blocked host: {0}")]
    BlockedHost(String),
}

#[derive(Debug, Clone)]
pub struct SanitizerConfig {
    pub max_url_length: usize,
    pub allow_private_ips: bool,
    pub blocked_hosts: HashSet<String>,
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            max_url_length: DEFAULT_MAX_URL_LENGTH,
            allow_private_ips: false,
            blocked_hosts: HashSet::new(),
        }
    }
}

pub struct UrlSanitizer {
    max_url_length: usize,
    allow_private_ips: bool,
    blocked_hosts: HashSet<String>,
}

impl UrlSanitizer {
    pub fn new(config: SanitizerConfig) -> Self {
        Self {
            max_url_length: config.max_url_length,
            allow_private_ips: config.allow_private_ips,
            blocked_hosts: config
                .blocked_hosts
                .into_iter()
                .map(|h| h.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        }
    }

    /// Validates `raw` and returns the trimmed URL on success. Checks
    /// short-circuit in order: emptiness, length, parse, scheme, host,
    /// block-list, private-address policy. Scheme checks run before the
    /// host check so hostless `javascript:`/`data:` URLs report the scheme,
    /// not a missing host.
    pub fn sanitize(&self, raw: &str) -> Result<String, SanitizeError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SanitizeError::EmptyUrl);
        }
        if trimmed.len() > self.max_url_length {
            return Err(SanitizeError::UrlTooLong {
                len: trimmed.len(),
                max: self.max_url_length,
            });
        }

        let parsed = url::Url::parse(trimmed).map_err(|e| SanitizeError::InvalidUrl(e.to_string()))?;

        let scheme = parsed.scheme();
        if DANGEROUS_SCHEMES.contains(&scheme) {
            return Err(SanitizeError::DangerousScheme(scheme.to_string()));
        }
        if !ALLOWED_SCHEMES.contains(&scheme) {
            return Err(SanitizeError::InvalidScheme(scheme.to_string()));
        }

        let host = match parsed.host() {
            Some(host) => host,
            None => return Err(SanitizeError::InvalidUrl("missing host".to_string())),
        };
        let host_text = match &host {
            Host::Domain(d) => d.to_ascii_lowercase(),
            Host::Ipv4(ip) => ip.to_string(),
            Host::Ipv6(ip) => ip.to_string(),
        };

        if self.is_blocked(&host_text) {
            return Err(SanitizeError::BlockedHost(host_text));
        }

        if !self.allow_private_ips {
            match host {
                Host::Domain(d) if d.eq_ignore_ascii_case("localhost") => {
                    return Err(SanitizeError::PrivateIp(host_text));
                }
                Host::Domain(_) => {}
                Host::Ipv4(ip) => {
                    if is_private_v4(ip) {
                        return Err(SanitizeError::PrivateIp(host_text));
                    }
                }
                Host::Ipv6(ip) => {
                    if is_private_v6(ip) {
                        return Err(SanitizeError::PrivateIp(host_text));
                    }
                }
            }
        }

        Ok(trimmed.to_string())
    }

    /// Case-insensitive match on the hostname and every parent-domain suffix
    /// (`a.b.example.com` matches a blocked `example.com`).
    fn is_blocked(&self, host: &str) -> bool {
        if self.blocked_hosts.is_empty() {
            return false;
        }
        let mut suffix = host;
        loop {
            if self.blocked_hosts.contains(suffix) {
                return true;
            }
            match suffix.split_once('.') {
                Some((_, rest)) if !rest.is_empty() => suffix = rest,
                _ => return false,
            }
        }
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    // Loopback, RFC1918, link-local 169.254/16, local multicast 224.0.0/24,
    // unspecified.
    let octets = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || (octets[0] == 224 && octets[1] == 0 && octets[2] == 0)
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return is_private_v4(mapped);
    }
    let seg0 = ip.segments()[0];
    // Loopback, unspecified, unique-local fc00::/7, link-local fe80::/10,
    // interface- and link-scope multicast (ff01::/16, ff02::/16).
    ip.is_loopback()
        || ip.is_unspecified()
        || (seg0 & 0xfe00) == 0xfc00
        || (seg0 & 0xffc0) == 0xfe80
        || ((seg0 & 0xff00) == 0xff00 && (seg0 & 0x000f) <= 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sanitizer() -> UrlSanitizer {
        UrlSanitizer::new(SanitizerConfig::default())
    }

    #[test]
    fn accepts_ordinary_urls() {
        let s = sanitizer();
        assert!(s.sanitize("https://example.com/x").is_ok());
        assert!(s.sanitize("http://example.com/path?q=1").is_ok());
        assert_eq!(s.sanitize("  https://example.com/x  ").unwrap(), "https://example.com/x");
    }

    #[test]
    fn rejects_empty_after_trim() {
        assert_eq!(sanitizer().sanitize("   "), Err(SanitizeError::EmptyUrl));
    }

    #[test]
    fn rejects_over_length_urls() {
        let long = format!("https://example.com/{}", "a".repeat(3000));
        assert!(matches!(
            sanitizer().sanitize(&long),
            Err(SanitizeError::UrlTooLong { .. })
        ));
    }

    #[test]
    fn rejects_dangerous_schemes() {
        let s = sanitizer();
        assert_eq!(
            s.sanitize("javascript:alert(1)"),
            Err(SanitizeError::DangerousScheme("javascript".to_string()))
        );
        assert_eq!(
            s.sanitize("data:text/html,<script>alert(1)</script>"),
            Err(SanitizeError::DangerousScheme("data".to_string()))
        );
        assert_eq!(
            s.sanitize("file:///etc/passwd"),
            Err(SanitizeError::DangerousScheme("file".to_string()))
        );
        assert_eq!(
            s.sanitize("VBScript:msgbox"),
            Err(SanitizeError::DangerousScheme("vbscript".to_string()))
        );
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert_eq!(
            sanitizer().sanitize("ftp://example.com"),
            Err(SanitizeError::InvalidScheme("ftp".to_string()))
        );
    }

    #[test]
    fn rejects_unparseable_urls() {
        assert!(matches!(sanitizer().sanitize("not a url"), Err(SanitizeError::InvalidUrl(_))));
    }

    #[test]
    fn rejects_private_and_local_targets() {
        let s = sanitizer();
        for target in [
            "http://localhost/",
            "http://127.0.0.1/",
            "http://192.168.1.1/",
            "http://10.0.0.1/",
            "http://172.16.5.5/",
            "http://169.254.1.1/",
            "http://[::1]/",
            "http://[fe80::1]/",
            "http://[fd00::1]/",
            "http://[::ffff:10.0.0.1]/",
            "http://0.0.0.0/",
        ] {
            assert!(
                matches!(s.sanitize(target), Err(SanitizeError::PrivateIp(_))),
                "expected {target} to be rejected"
            );
        }
    }

    #[test]
    fn allow_private_ips_opts_out_of_the_policy() {
        let s = UrlSanitizer::new(SanitizerConfig {
            allow_private_ips: true,
            ..SanitizerConfig::default()
        });
        assert!(s.sanitize("http://127.0.0.1/").is_ok());
        assert!(s.sanitize("http://localhost/dev").is_ok());
    }

    #[test]
    fn blocked_hosts_match_exact_and_parent_domains() {
        let s = UrlSanitizer::new(SanitizerConfig {
            blocked_hosts: ["evil.test".to_string()].into_iter().collect(),
            ..SanitizerConfig::default()
        });
        assert!(matches!(
            s.sanitize("https://evil.test/x"),
            Err(SanitizeError::BlockedHost(_))
        ));
        assert!(matches!(
            s.sanitize("https://deep.sub.evil.test/x"),
            Err(SanitizeError::BlockedHost(_))
        ));
        assert!(matches!(
            s.sanitize("https://EVIL.TEST/x"),
            Err(SanitizeError::BlockedHost(_))
        ));
        assert!(s.sanitize("https://notevil.test/x").is_ok());
    }

    #[test]
    fn public_ip_literals_pass() {
        assert!(sanitizer().sanitize("http://93.184.216.34/").is_ok());
    }
}
