//! Outbound URL checks (SSRF protection) and bounded response reads
//!
//! Every URL a handler is about to call passes through [`outbound_host`]
//! before the governor compares the host with the app's allowlist.
//! Response bodies from those hosts are read with [`read_capped`], so a
//! host cannot make the runtime buffer more than a fixed number of bytes.

use std::net::{IpAddr, Ipv4Addr};

/// Parse an outbound URL and return its lowercase host.
///
/// Rejects non-http(s) schemes, hostname encoding tricks, and (unless
/// `allow_private` is set) loopback, private, link-local and cloud metadata
/// addresses.
pub fn outbound_host(url: &str, allow_private: bool) -> Result<String, String> {
    let parsed = url::Url::parse(url).map_err(|e| format!("invalid URL: {}", e))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(format!(
                "scheme '{}' is not allowed, only http/https",
                scheme
            ))
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| "URL has no host".to_string())?
        .to_ascii_lowercase();

    if host.contains('%') || host.contains("0x") {
        return Err("encoded hostnames are not allowed".to_string());
    }

    if allow_private {
        return Ok(host);
    }

    if host == "localhost" || host.ends_with(".localhost") || host.ends_with(".localdomain") {
        return Err("localhost is not allowed".to_string());
    }

    let ip = match parsed.host() {
        Some(url::Host::Ipv4(ip)) => Some(IpAddr::V4(ip)),
        Some(url::Host::Ipv6(ip)) => Some(IpAddr::V6(ip)),
        Some(url::Host::Domain(domain)) => domain.parse::<IpAddr>().ok(),
        None => None,
    };
    if let Some(ip) = ip {
        if is_private_ip(&ip) {
            return Err(format!("private address {} is not allowed", ip));
        }
    }

    if host.ends_with(".internal") || host == "metadata.google.internal" {
        return Err("cloud metadata endpoints are not allowed".to_string());
    }

    Ok(host)
}

pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7
                || (octets[0] & 0xfe) == 0xfc
                // fe80::/10 and fec0::/10
                || (octets[0] == 0xfe && (octets[1] & 0x80) == 0x80)
                || v6.to_ipv4_mapped().is_some_and(|v4| is_private_v4(&v4))
        }
    }
}

fn is_private_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, _, _] = ip.octets();
    a == 10
        || (a == 172 && (16..=31).contains(&b))
        || (a == 192 && b == 168)
        || a == 127
        || (a == 169 && b == 254)
        || ip.is_unspecified()
}

/// Response body read up to a byte limit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CappedBody {
    pub bytes: Vec<u8>,
    /// The body had more than `limit` bytes; the rest was never read
    pub truncated: bool,
}

impl CappedBody {
    pub fn into_text(self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Read `response` chunk by chunk, stopping once `limit` bytes are buffered
pub async fn read_capped(
    mut response: reqwest::Response,
    limit: usize,
) -> Result<CappedBody, reqwest::Error> {
    let announced = response.content_length().unwrap_or(0) as usize;
    let mut bytes = Vec::with_capacity(announced.min(limit));

    while let Some(chunk) = response.chunk().await? {
        let room = limit - bytes.len();
        if chunk.len() > room {
            bytes.extend_from_slice(&chunk[..room]);
            return Ok(CappedBody {
                bytes,
                truncated: true,
            });
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(CappedBody {
        bytes,
        truncated: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_https_passes() {
        assert_eq!(
            outbound_host("https://API.Example.com/v1", false).unwrap(),
            "api.example.com"
        );
    }

    #[test]
    fn rejects_non_http_schemes() {
        assert!(outbound_host("file:///etc/passwd", false).is_err());
        assert!(outbound_host("ftp://example.com", false).is_err());
    }

    #[test]
    fn rejects_private_targets() {
        for url in [
            "http://localhost:8080",
            "http://127.0.0.1/",
            "http://10.1.2.3/",
            "http://192.168.0.1/",
            "http://169.254.169.254/latest/meta-data",
            "http://[::1]/",
            "http://metadata.google.internal/",
        ] {
            assert!(outbound_host(url, false).is_err(), "{} should be blocked", url);
        }
    }

    #[test]
    fn private_hosts_allowed_when_configured() {
        assert_eq!(outbound_host("http://127.0.0.1:9000/x", true).unwrap(), "127.0.0.1");
    }

    #[test]
    fn ipv4_mapped_ipv6_is_checked() {
        let ip = IpAddr::V6(Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped());
        assert!(is_private_ip(&ip));
        let ip = IpAddr::V6(Ipv4Addr::new(8, 8, 8, 8).to_ipv6_mapped());
        assert!(!is_private_ip(&ip));
    }

    #[tokio::test]
    async fn read_capped_stops_at_limit() {
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(wiremock::matchers::any())
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(10_000)))
            .mount(&server)
            .await;

        let response = reqwest::get(server.uri()).await.unwrap();
        let body = read_capped(response, 1024).await.unwrap();
        assert!(body.truncated);
        assert_eq!(body.bytes.len(), 1024);

        let response = reqwest::get(server.uri()).await.unwrap();
        let body = read_capped(response, 20_000).await.unwrap();
        assert!(!body.truncated);
        assert_eq!(body.into_text().len(), 10_000);
    }
}
