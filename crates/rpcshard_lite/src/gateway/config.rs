use bon::Builder;
use tokio_tungstenite::tungstenite::http::HeaderMap;

use crate::group::GroupConfig;
use crate::shard::DEFAULT_OUTBOUND_CAPACITY;

pub const DEFAULT_RPC_PATH: &str = "/rpc";

/// Frames of one connection that may be dispatching at the same time.
pub const DEFAULT_MAX_INFLIGHT_FRAMES: usize = 64;

const UNKNOWN_LOCALITY: &str = "unknown";

/// Configuration for the gateway entrypoint.
#[derive(Debug, Clone, Builder)]
pub struct GatewayConfig {
    /// Path that accepts the WebSocket upgrade (e.g., "/rpc").
    #[builder(into, default = DEFAULT_RPC_PATH.to_owned())]
    pub rpc_path: String,

    /// Request header carrying the client's country.
    #[builder(into, default = "cf-ipcountry".to_owned())]
    pub country_header: String,

    /// Request header carrying the client's city.
    #[builder(into, default = "cf-ipcity".to_owned())]
    pub city_header: String,

    /// Frames each connection may have queued for writing. Frames beyond
    /// this are dropped.
    #[builder(default = DEFAULT_OUTBOUND_CAPACITY)]
    pub outbound_capacity: usize,

    /// Inbound frames of one connection dispatched concurrently. Reading
    /// pauses while the limit is reached.
    #[builder(default = DEFAULT_MAX_INFLIGHT_FRAMES)]
    pub max_inflight_frames: usize,

    /// Shard sizing shared by all groups.
    #[builder(default)]
    pub group: GroupConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl GatewayConfig {
    /// Locality key of an upgrade request: `<country>_<city>`.
    pub fn group_key(&self, headers: &HeaderMap) -> String {
        let country = header_or_unknown(headers, &self.country_header);
        let city = header_or_unknown(headers, &self.city_header);
        format!("{country}_{city}")
    }
}

fn header_or_unknown<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(UNKNOWN_LOCALITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::http::HeaderValue;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.rpc_path, "/rpc");
        assert_eq!(config.country_header, "cf-ipcountry");
        assert_eq!(config.group.capacity, 1000);
        assert_eq!(config.group.max_shards, None);
        assert_eq!(config.outbound_capacity, DEFAULT_OUTBOUND_CAPACITY);
        assert_eq!(config.max_inflight_frames, DEFAULT_MAX_INFLIGHT_FRAMES);
    }

    #[test]
    fn test_group_key_from_headers() {
        let config = GatewayConfig::default();
        let mut headers = HeaderMap::new();
        headers.insert("cf-ipcountry", HeaderValue::from_static("US"));
        headers.insert("cf-ipcity", HeaderValue::from_static("Austin"));
        assert_eq!(config.group_key(&headers), "US_Austin");
    }

    #[test]
    fn test_group_key_missing_headers() {
        let config = GatewayConfig::builder()
            .country_header("x-country")
            .build();
        let mut headers = HeaderMap::new();
        headers.insert("x-country", HeaderValue::from_static("DE"));
        headers.insert("cf-ipcity", HeaderValue::from_static(""));
        assert_eq!(config.group_key(&headers), "DE_unknown");
        assert_eq!(config.group_key(&HeaderMap::new()), "unknown_unknown");
    }
}
