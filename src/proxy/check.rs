//! Proxy connectivity probing
//!
//! Issues one request through the candidate proxy against an IP-echo
//! endpoint and compares with the direct egress IP.

use std::time::{Duration, Instant};

use tracing::info;

use super::pool::Proxy;

const IP_ECHO_URL: &str = "https://api.ipify.org/?format=json";

/// Outcome of a proxy connectivity probe.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub working: bool,
    pub direct_ip: Option<String>,
    pub proxy_ip: Option<String>,
    pub error: Option<String>,
    pub probe_time_ms: u64,
}

async fn fetch_ip(client: &reqwest::Client) -> Result<String, String> {
    let response = client
        .get(IP_ECHO_URL)
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;
    if !response.status().is_success() {
        return Err(format!("HTTP {}", response.status()));
    }
    let data: serde_json::Value = response
        .json()
        .await
        .map_err(|e| format!("failed to parse response: {e}"))?;
    data.get("ip")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| "no IP in response".to_string())
}

/// Probe a proxy end to end. Never errors; failures land in the result.
pub async fn probe_proxy(proxy: &Proxy, timeout: Duration) -> ProbeResult {
    let started = Instant::now();

    let direct_ip = match reqwest::Client::builder()
        .no_proxy()
        .timeout(timeout)
        .build()
    {
        Ok(client) => fetch_ip(&client).await.ok(),
        Err(_) => None,
    };

    let reqwest_proxy = match reqwest::Proxy::all(proxy.server_url()) {
        Ok(p) => match &proxy.auth {
            Some(auth) => p.basic_auth(&auth.username, &auth.password),
            None => p,
        },
        Err(e) => {
            return ProbeResult {
                working: false,
                direct_ip,
                proxy_ip: None,
                error: Some(format!("invalid proxy URL: {e}")),
                probe_time_ms: started.elapsed().as_millis() as u64,
            }
        }
    };

    let client = match reqwest::Client::builder()
        .proxy(reqwest_proxy)
        .timeout(timeout)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            return ProbeResult {
                working: false,
                direct_ip,
                proxy_ip: None,
                error: Some(format!("failed to build client: {e}")),
                probe_time_ms: started.elapsed().as_millis() as u64,
            }
        }
    };

    match fetch_ip(&client).await {
        Ok(ip) => {
            info!(key = %proxy.key(), egress = %ip, "proxy probe succeeded");
            ProbeResult {
                working: true,
                direct_ip,
                proxy_ip: Some(ip),
                error: None,
                probe_time_ms: started.elapsed().as_millis() as u64,
            }
        }
        Err(e) => ProbeResult {
            working: false,
            direct_ip,
            proxy_ip: None,
            error: Some(e),
            probe_time_ms: started.elapsed().as_millis() as u64,
        },
    }
}
