use std::net::IpAddr;
use std::time::Duration;

use reqwest::ClientBuilder;

fn has_proxy_env() -> bool {
    [
        "HTTPS_PROXY",
        "https_proxy",
        "HTTP_PROXY",
        "http_proxy",
        "ALL_PROXY",
        "all_proxy",
    ]
    .iter()
    .any(|k| std::env::var(k).is_ok_and(|v| !v.trim().is_empty()))
}

fn allow_proxy_for_localhost() -> bool {
    std::env::var("GATEWAY_ALLOW_PROXY_FOR_LOCALHOST")
        .is_ok_and(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes" | "YES"))
}

fn is_loopback_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") || host.ends_with(".localhost") {
        return true;
    }
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    trimmed
        .parse::<IpAddr>()
        .is_ok_and(|ip| ip.is_loopback() || ip.is_unspecified())
}

fn should_bypass_proxy_impl(url: &str, proxy_env_present: bool, allow_proxy: bool) -> bool {
    if !proxy_env_present || allow_proxy {
        return false;
    }

    let Ok(u) = reqwest::Url::parse(url) else {
        return false;
    };
    let Some(host) = u.host_str() else {
        return false;
    };

    // 本地中转（例如另一个本机网关）不能走系统代理
    is_loopback_host(host)
}

pub fn should_bypass_proxy_for_url(url: &str) -> bool {
    should_bypass_proxy_impl(url, has_proxy_env(), allow_proxy_for_localhost())
}

fn base_builder(connect_timeout: Duration) -> ClientBuilder {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .pool_idle_timeout(Duration::from_secs(90))
}

/// A proxy-respecting client and a direct one; picked per upstream URL.
#[derive(Clone)]
pub struct UpstreamClients {
    proxied: reqwest::Client,
    direct: reqwest::Client,
}

impl UpstreamClients {
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            proxied: base_builder(connect_timeout).build()?,
            direct: base_builder(connect_timeout).no_proxy().build()?,
        })
    }

    pub fn for_url(&self, url: &str) -> &reqwest::Client {
        if should_bypass_proxy_for_url(url) {
            &self.direct
        } else {
            &self.proxied
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bypass_proxy_for_loopback_when_proxy_env_present() {
        assert!(should_bypass_proxy_impl(
            "http://127.0.0.1:8080/v1/chat/completions",
            true,
            false
        ));
        assert!(should_bypass_proxy_impl("http://localhost:3000", true, false));
        assert!(should_bypass_proxy_impl("http://[::1]:9000/v1", true, false));
        assert!(!should_bypass_proxy_impl(
            "https://api.openai.com/v1/responses",
            true,
            false
        ));
    }

    #[test]
    fn do_not_bypass_without_proxy_env_or_with_escape_hatch() {
        assert!(!should_bypass_proxy_impl("http://127.0.0.1:8080", false, false));
        assert!(!should_bypass_proxy_impl("http://127.0.0.1:8080", true, true));
    }
}
