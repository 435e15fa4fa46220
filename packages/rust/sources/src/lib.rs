//! HTTP adapters for the search and document extraction capabilities.
//!
//! - [`HttpSearch`]: a JSON search endpoint, with authority hints taken from
//!   each country's official domain table
//! - [`HttpDocumentExtractor`]: fetches a document and splits HTML or plain
//!   text into [`SourceChunk`](curricula_shared::SourceChunk)s
//!
//! Both refuse private and loopback targets.

mod document;
mod search;

use std::net::IpAddr;
use std::time::Duration;

use curricula_shared::{CurriculaError, Result};
use reqwest::Client;
use url::Url;

pub use document::HttpDocumentExtractor;
pub use search::HttpSearch;

/// User-Agent string for outbound requests.
const USER_AGENT: &str = concat!("Curricula/", env!("CARGO_PKG_VERSION"));

/// Maximum number of redirects to follow.
const MAX_REDIRECTS: usize = 5;

fn build_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| CurriculaError::Network(format!("failed to build HTTP client: {e}")))
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
fn is_ssrf_target(url: &Url) -> bool {
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    if let Some(host) = url.host_str() {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return is_private_ip(&ip);
        }
        if host == "localhost" || host.ends_with(".local") || host.ends_with(".internal") {
            return true;
        }
    }

    false
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssrf_blocks_non_http_and_private() {
        for url in [
            "file:///etc/passwd",
            "http://10.0.0.1/doc",
            "http://192.168.1.4/doc",
            "http://localhost:8080/",
            "http://[::1]/",
            "http://printer.local/",
        ] {
            assert!(is_ssrf_target(&Url::parse(url).unwrap()), "{url}");
        }
    }

    #[test]
    fn ssrf_allows_public_hosts() {
        let url = Url::parse("https://nerdc.gov.ng/curriculum.pdf").unwrap();
        assert!(!is_ssrf_target(&url));
    }
}
