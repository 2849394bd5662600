use reqwest::{Client, Proxy};
use std::time::Duration;
use tracing::{info, warn};

/// Build the HTTP client used for the sync endpoint.
///
/// - `proxy`: `None` follows HTTPS_PROXY/HTTP_PROXY, `Some("")` forces a
///   direct connection, anything else is used as the proxy URL.
pub fn build_http_client(proxy: Option<&str>, endpoint: &str, timeout: Duration) -> Client {
    let mut builder = Client::builder().timeout(timeout);

    match proxy {
        Some("") => {
            info!(endpoint = %endpoint, "Sync client forced to direct connect (proxy disabled)");
            builder = builder.no_proxy();
        }
        Some(proxy_url) => match Proxy::all(proxy_url) {
            Ok(p) => {
                info!(proxy = %proxy_url, endpoint = %endpoint, "Sync client using proxy");
                builder = builder.proxy(p);
            }
            Err(e) => {
                warn!(error = %e, proxy = %proxy_url, "Invalid proxy URL, falling back to direct connect");
            }
        },
        None => {}
    }

    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to build HTTP client with proxy, using default");
        Client::new()
    })
}

/// Host part of a URL, for log fields.
pub fn endpoint_host(url: &str) -> &str {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let host_port = without_scheme.split(['/', '?']).next().unwrap_or(without_scheme);
    host_port.rsplit('@').next().unwrap_or(host_port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_host() {
        assert_eq!(endpoint_host("https://app.example.com/api/sync"), "app.example.com");
        assert_eq!(endpoint_host("http://127.0.0.1:8080?token=x"), "127.0.0.1:8080");
        assert_eq!(endpoint_host("https://u:p@proxy.local:3128/"), "proxy.local:3128");
    }

    #[test]
    fn test_build_http_client_variants() {
        let t = Duration::from_secs(5);
        drop(build_http_client(None, "https://app.example.com", t));
        drop(build_http_client(Some(""), "https://app.example.com", t));
        drop(build_http_client(Some("not a url"), "https://app.example.com", t));
    }
}
