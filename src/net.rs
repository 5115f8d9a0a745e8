//! Guarded HTTP asset downloads
//!
//! External references inside archived HTML are fetched under an SSRF guard
//! (scheme allowlist, private-address rejection, DNS watchdog) and hard
//! resource caps. A denied or failed download is recorded, never fatal.

use std::net::IpAddr;
use std::time::Duration;

use futures::TryStreamExt;
use hickory_resolver::TokioResolver;
use tokio::time::{Instant, timeout};
use url::Url;

/// DNS resolution watchdog: resolvers can hang far longer than this
const DNS_TIMEOUT: Duration = Duration::from_secs(3);

/// Why a download did not produce bytes
#[derive(Debug)]
pub enum DownloadError {
    /// Denied by policy or budget; the reason becomes `blocked:<reason>`
    Blocked(String),
    /// Transport or server failure; becomes `error:<detail>`
    Failed(String),
}

impl DownloadError {
    fn blocked(reason: impl Into<String>) -> Self {
        Self::Blocked(reason.into())
    }
}

/// Per-request limits for one asset fetch
#[derive(Debug, Clone, Copy)]
pub struct FetchLimits {
    /// Total per-asset timeout in seconds
    pub timeout_s: u64,
    /// Remaining byte budget for the whole message
    pub max_bytes: u64,
    /// Wall-clock deadline for the message's external stage
    pub deadline: Instant,
}

/// Build the shared HTTP client for asset downloads
///
/// Connect timeout is `min(10, timeout_s)` to avoid long stalls on
/// unresponsive hosts.
pub fn asset_client(timeout_s: u64) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent("MailDigest/1.0")
        .connect_timeout(Duration::from_secs(timeout_s.min(10)))
        .build()
}

/// Whether an address must never be fetched from
///
/// Loopback, RFC1918, link-local, multicast, unspecified, broadcast, and
/// reserved ranges all count as private for the guard.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || v4.octets()[0] >= 240
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_ip(IpAddr::V4(mapped));
            }
            let seg0 = v6.segments()[0];
            v6.is_loopback()
                || v6.is_multicast()
                || v6.is_unspecified()
                || (seg0 & 0xfe00) == 0xfc00 // unique local fc00::/7
                || (seg0 & 0xffc0) == 0xfe80 // link local fe80::/10
        }
    }
}

/// Validate that a URL points at a public host
///
/// IP literals are checked directly; hostnames are resolved under the DNS
/// watchdog and rejected if any resolved address is private.
pub async fn validate_public_host(url: &Url) -> Result<(), DownloadError> {
    let host = url
        .host_str()
        .ok_or_else(|| DownloadError::blocked("missing hostname"))?;

    if host.eq_ignore_ascii_case("localhost") {
        return Err(DownloadError::blocked("localhost blocked"));
    }

    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(DownloadError::blocked("private ip blocked"));
        }
        return Ok(());
    }

    let resolver = TokioResolver::builder_tokio()
        .map_err(|e| DownloadError::Failed(format!("dns resolver unavailable: {e}")))?
        .build();

    let lookup = timeout(DNS_TIMEOUT, resolver.lookup_ip(host))
        .await
        .map_err(|_| DownloadError::blocked("dns resolve timeout"))?
        .map_err(|_| DownloadError::blocked("dns resolve failed"))?;

    let mut any = false;
    for ip in lookup.iter() {
        any = true;
        if is_private_ip(ip) {
            return Err(DownloadError::blocked("private ip blocked"));
        }
    }
    if !any {
        return Err(DownloadError::blocked("dns resolve failed"));
    }
    Ok(())
}

/// A completed asset download
#[derive(Debug)]
pub struct DownloadedAsset {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Download one asset into memory under the guard and limits
///
/// Streams the response in chunks with a running byte counter; the deadline
/// and byte budget are re-checked per chunk so a slow trickle cannot blow
/// past either.
pub async fn stream_download(
    client: &reqwest::Client,
    raw_url: &str,
    limits: &FetchLimits,
) -> Result<DownloadedAsset, DownloadError> {
    let url = Url::parse(raw_url).map_err(|e| DownloadError::blocked(format!("bad url: {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(DownloadError::blocked(format!(
            "scheme not allowed: {}",
            url.scheme()
        )));
    }
    if Instant::now() > limits.deadline {
        return Err(DownloadError::blocked("time budget exceeded"));
    }

    validate_public_host(&url).await?;

    let resp = client
        .get(url)
        .timeout(Duration::from_secs(limits.timeout_s))
        .send()
        .await
        .map_err(|e| DownloadError::Failed(format!("request failed: {e}")))?
        .error_for_status()
        .map_err(|e| DownloadError::Failed(format!("http status: {e}")))?;

    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_owned());

    let mut total: u64 = 0;
    let mut out = Vec::new();
    let mut stream = resp.bytes_stream();
    loop {
        let chunk = timeout(Duration::from_secs(limits.timeout_s), stream.try_next())
            .await
            .map_err(|_| DownloadError::Failed("read timed out".to_owned()))?
            .map_err(|e| DownloadError::Failed(format!("read failed: {e}")))?;
        let Some(chunk) = chunk else {
            break;
        };
        if Instant::now() > limits.deadline {
            return Err(DownloadError::blocked("time budget exceeded"));
        }
        total += chunk.len() as u64;
        if total > limits.max_bytes {
            return Err(DownloadError::blocked("download exceeds max_bytes"));
        }
        out.extend_from_slice(&chunk);
    }
    Ok(DownloadedAsset {
        bytes: out,
        content_type,
    })
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::time::Duration;

    use tokio::time::Instant;
    use url::Url;

    use super::{DownloadError, FetchLimits, asset_client, is_private_ip, stream_download,
        validate_public_host};

    fn ip(s: &str) -> IpAddr {
        s.parse().expect("ip literal")
    }

    #[test]
    fn private_ranges_are_rejected() {
        for addr in [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.9",
            "192.168.1.1",
            "169.254.0.5",
            "224.0.0.1",
            "255.255.255.255",
            "0.0.0.0",
            "240.0.0.1",
            "::1",
            "fe80::1",
            "fc00::1",
            "ff02::1",
            "::ffff:192.168.0.1",
        ] {
            assert!(is_private_ip(ip(addr)), "{addr} should be private");
        }
    }

    #[test]
    fn public_addresses_pass() {
        for addr in ["93.184.216.34", "8.8.8.8", "2606:2800:220:1:248:1893:25c8:1946"] {
            assert!(!is_private_ip(ip(addr)), "{addr} should be public");
        }
    }

    #[tokio::test]
    async fn ip_literal_loopback_is_blocked_without_dns() {
        let url = Url::parse("http://127.0.0.1:8080/x.png").expect("url");
        match validate_public_host(&url).await {
            Err(DownloadError::Blocked(reason)) => assert_eq!(reason, "private ip blocked"),
            other => panic!("expected blocked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn localhost_name_is_blocked_without_dns() {
        let url = Url::parse("http://localhost/x").expect("url");
        match validate_public_host(&url).await {
            Err(DownloadError::Blocked(reason)) => assert_eq!(reason, "localhost blocked"),
            other => panic!("expected blocked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disallowed_scheme_is_blocked_before_any_io() {
        let client = asset_client(20).expect("client");
        let limits = FetchLimits {
            timeout_s: 20,
            max_bytes: 1024,
            deadline: Instant::now() + Duration::from_secs(90),
        };
        match stream_download(&client, "file:///etc/passwd", &limits).await {
            Err(DownloadError::Blocked(reason)) => {
                assert!(reason.starts_with("scheme not allowed"));
            }
            other => panic!("expected blocked, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_deadline_blocks_immediately() {
        let client = asset_client(20).expect("client");
        let limits = FetchLimits {
            timeout_s: 20,
            max_bytes: 1024,
            deadline: Instant::now(),
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        match stream_download(&client, "http://example.com/a.png", &limits).await {
            Err(DownloadError::Blocked(reason)) => assert_eq!(reason, "time budget exceeded"),
            other => panic!("expected blocked, got {other:?}"),
        }
    }
}
