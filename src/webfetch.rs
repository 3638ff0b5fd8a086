//! SSRF-guarded web fetching.
//!
//! HTTPS only. Hostnames are resolved before any request and rejected when
//! every address is loopback, private, link-local, or unspecified. Redirects
//! are followed manually (at most six) so every hop passes the same filter.
//! Response bodies are capped; the content type is sniffed when the server
//! does not send one.

use url::Url;

use crate::error::{Error, Result};

/// Maximum redirect hops.
pub const MAX_REDIRECTS: usize = 6;
/// Default response byte cap.
pub const DEFAULT_MAX_BYTES: usize = 8 * 1024 * 1024;

/// A fetched document.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub final_url: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Whether this URL may be fetched: HTTPS, a resolvable host, and at least
/// one resolved address that is publicly routable — with no forbidden
/// address among them (a name resolving to both public and private
/// addresses is rejected outright).
pub async fn is_allowed_web_url(raw: &str) -> bool {
    let Ok(url) = Url::parse(raw) else { return false };
    if url.scheme() != "https" {
        return false;
    }
    let Some(host) = url.host_str() else { return false };
    // IPv6 literals come back bracketed; lookup_host wants them bare.
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port = url.port_or_known_default().unwrap_or(443);

    let Ok(addrs) = tokio::net::lookup_host((host, port)).await else {
        return false;
    };
    let addrs: Vec<std::net::SocketAddr> = addrs.collect();
    if addrs.is_empty() {
        return false;
    }
    addrs.iter().all(|addr| !is_forbidden_ip(&addr.ip()))
}

/// Loopback, private, link-local (169.254/16), unspecified, and their IPv6
/// equivalents (including unique-local fc00::/7 and fe80::/10).
fn is_forbidden_ip(ip: &std::net::IpAddr) -> bool {
    match ip {
        std::net::IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        std::net::IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                || (segments[0] & 0xfe00) == 0xfc00 // unique local fc00::/7
                || (segments[0] & 0xffc0) == 0xfe80 // link local fe80::/10
                || v6.to_ipv4_mapped().map(|v4| {
                    is_forbidden_ip(&std::net::IpAddr::V4(v4))
                }).unwrap_or(false)
        }
    }
}

/// Fetch a URL under the SSRF policy with a byte cap.
///
/// The client must be built with redirects disabled; hops are followed here
/// so each intermediate URL is re-checked.
pub async fn fetch_checked(
    client: &reqwest::Client,
    raw_url: &str,
    max_bytes: usize,
) -> Result<FetchedDocument> {
    let mut current = raw_url.to_owned();

    for _hop in 0..=MAX_REDIRECTS {
        if !is_allowed_web_url(&current).await {
            return Err(Error::MissingInput(format!("url not allowed: {current}")));
        }

        let response = client
            .get(&current)
            .send()
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("fetch failed: {e}")))?;

        if response.status().is_redirection() {
            let Some(location) = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
            else {
                return Err(Error::MissingInput("redirect without location".into()));
            };
            // Resolve relative redirects against the current URL.
            let base = Url::parse(&current)
                .map_err(|e| Error::MissingInput(format!("bad url: {e}")))?;
            let next = base
                .join(location)
                .map_err(|e| Error::MissingInput(format!("bad redirect target: {e}")))?;
            current = next.to_string();
            continue;
        }

        let header_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let mut bytes: Vec<u8> = Vec::new();
        let mut response = response;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("read failed: {e}")))?
        {
            if bytes.len() + chunk.len() > max_bytes {
                return Err(Error::MissingInput(format!(
                    "response exceeds {max_bytes} byte cap"
                )));
            }
            bytes.extend_from_slice(&chunk);
        }

        let content_type = header_type.unwrap_or_else(|| sniff_content_type(&bytes).to_owned());
        return Ok(FetchedDocument { final_url: current, content_type, bytes });
    }

    Err(Error::MissingInput(format!(
        "more than {MAX_REDIRECTS} redirects from {raw_url}"
    )))
}

/// Best-effort content-type sniff for responses without a header.
pub fn sniff_content_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"%PDF") {
        return "application/pdf";
    }
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        return "image/png";
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return "image/jpeg";
    }
    let head: Vec<u8> = bytes
        .iter()
        .copied()
        .skip_while(|b| b.is_ascii_whitespace())
        .take(16)
        .collect();
    if head.starts_with(b"<") {
        return "text/html";
    }
    if head.starts_with(b"{") || head.starts_with(b"[") {
        return "application/json";
    }
    if std::str::from_utf8(bytes).is_ok() {
        return "text/plain";
    }
    "application/octet-stream"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn non_https_schemes_are_rejected() {
        assert!(!is_allowed_web_url("http://example.com/").await);
        assert!(!is_allowed_web_url("ftp://example.com/").await);
        assert!(!is_allowed_web_url("file:///etc/passwd").await);
        assert!(!is_allowed_web_url("gopher://example.com/").await);
    }

    #[tokio::test]
    async fn loopback_and_private_literals_are_rejected() {
        assert!(!is_allowed_web_url("https://127.0.0.1/").await);
        assert!(!is_allowed_web_url("https://10.0.0.8/admin").await);
        assert!(!is_allowed_web_url("https://192.168.1.1/").await);
        assert!(!is_allowed_web_url("https://172.16.0.1/").await);
        assert!(!is_allowed_web_url("https://169.254.169.254/latest/meta-data").await);
        assert!(!is_allowed_web_url("https://0.0.0.0/").await);
        assert!(!is_allowed_web_url("https://[::1]/").await);
        assert!(!is_allowed_web_url("https://[fe80::1]/").await);
        assert!(!is_allowed_web_url("https://[fc00::1]/").await);
        assert!(!is_allowed_web_url("https://[::ffff:127.0.0.1]/").await);
    }

    #[tokio::test]
    async fn public_ip_literals_are_allowed() {
        assert!(is_allowed_web_url("https://1.1.1.1/").await);
        assert!(is_allowed_web_url("https://93.184.216.34/page").await);
    }

    #[tokio::test]
    async fn localhost_name_is_rejected_after_resolution() {
        assert!(!is_allowed_web_url("https://localhost/").await);
    }

    #[tokio::test]
    async fn garbage_urls_are_rejected() {
        assert!(!is_allowed_web_url("not a url").await);
        assert!(!is_allowed_web_url("https://").await);
    }

    #[test]
    fn forbidden_ip_table() {
        use std::net::IpAddr;
        let forbidden = ["127.0.0.1", "10.1.2.3", "192.168.0.1", "172.31.0.1", "169.254.0.1", "0.0.0.0"];
        for ip in forbidden {
            assert!(is_forbidden_ip(&ip.parse::<IpAddr>().unwrap()), "{ip} must be forbidden");
        }
        let allowed = ["8.8.8.8", "1.1.1.1", "172.32.0.1", "2606:4700:4700::1111"];
        for ip in allowed {
            assert!(!is_forbidden_ip(&ip.parse::<IpAddr>().unwrap()), "{ip} must be allowed");
        }
    }

    #[test]
    fn content_type_sniffing() {
        assert_eq!(sniff_content_type(b"%PDF-1.7 ..."), "application/pdf");
        assert_eq!(sniff_content_type(b"  <html><body>"), "text/html");
        assert_eq!(sniff_content_type(b"{\"k\": 1}"), "application/json");
        assert_eq!(sniff_content_type(b"plain words"), "text/plain");
        assert_eq!(sniff_content_type(&[0x00, 0x01, 0x02]), "application/octet-stream");
        assert_eq!(sniff_content_type(&[0x89, b'P', b'N', b'G']), "image/png");
    }
}
