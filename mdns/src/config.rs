//! Engine configuration. Every field carries a documented default and can
//! be overridden from a config file or from the process environment via
//! `MdnsConfig::from_env`.

use std::time::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MdnsConfig {
    #[serde(default = "default_ipv4_group")]
    pub ipv4_group: String,
    #[serde(default = "default_ipv6_group")]
    pub ipv6_group: String,
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_resolution_timeout_ms")]
    pub resolution_timeout_ms: u64,
    #[serde(default = "default_resolution_interval_ms")]
    pub resolution_interval_ms: u64,

    #[serde(default = "default_probing_timeout_ms")]
    pub probing_timeout_ms: u64,
    #[serde(default = "default_probing_interval_ms")]
    pub probing_interval_ms: u64,
    #[serde(default = "default_probing_number")]
    pub probing_number: usize,

    /// Upper bound of the randomized first-query delay (RFC 6762 §5.2).
    #[serde(default = "default_querying_delay_ms")]
    pub querying_delay_ms: u64,
    #[serde(default = "default_querying_interval_ms")]
    pub querying_interval_ms: u64,
    #[serde(default = "default_querying_backoff_factor")]
    pub querying_backoff_factor: u32,
    #[serde(default = "default_querying_max_interval_ms")]
    pub querying_max_interval_ms: u64,
    /// Hint only; the browser's increasing-rate backoff is the authoritative
    /// rate control, this field is carried for informational purposes.
    #[serde(default = "default_querying_number")]
    pub querying_number: usize,

    #[serde(default = "default_announcement_number")]
    pub announcement_number: usize,
    #[serde(default = "default_announcement_interval_ms")]
    pub announcement_interval_ms: u64,

    #[serde(default = "default_cancellation_number")]
    pub cancellation_number: usize,
    #[serde(default = "default_cancellation_interval_ms")]
    pub cancellation_interval_ms: u64,

    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,

    #[serde(default = "default_ttl_default_secs")]
    pub ttl_default_secs: u32,
    #[serde(default = "default_ttl_expiry_secs")]
    pub ttl_expiry_secs: u32,

    /// Bound on the engine's inbound fan-out broadcast channel; slow
    /// subscribers may lag rather than stall the receiver.
    #[serde(default = "default_inbound_channel_capacity")]
    pub inbound_channel_capacity: usize,
}

fn default_ipv4_group() -> String {
    "224.0.0.251".to_string()
}
fn default_ipv6_group() -> String {
    "FF02::FB".to_string()
}
fn default_port() -> u16 {
    5353
}
fn default_resolution_timeout_ms() -> u64 {
    6000
}
fn default_resolution_interval_ms() -> u64 {
    200
}
fn default_probing_timeout_ms() -> u64 {
    6000
}
fn default_probing_interval_ms() -> u64 {
    250
}
fn default_probing_number() -> usize {
    3
}
fn default_querying_delay_ms() -> u64 {
    120
}
fn default_querying_interval_ms() -> u64 {
    1000
}
fn default_querying_backoff_factor() -> u32 {
    2
}
fn default_querying_max_interval_ms() -> u64 {
    60 * 60 * 1000
}
fn default_querying_number() -> usize {
    3
}
fn default_announcement_number() -> usize {
    3
}
fn default_announcement_interval_ms() -> u64 {
    250
}
fn default_cancellation_number() -> usize {
    3
}
fn default_cancellation_interval_ms() -> u64 {
    250
}
fn default_reaper_interval_ms() -> u64 {
    10_000
}
fn default_ttl_default_secs() -> u32 {
    3600
}
fn default_ttl_expiry_secs() -> u32 {
    1
}
fn default_inbound_channel_capacity() -> usize {
    256
}

impl Default for MdnsConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("all MdnsConfig fields have defaults")
    }
}

impl MdnsConfig {
    pub fn resolution_timeout(&self) -> Duration {
        Duration::from_millis(self.resolution_timeout_ms)
    }
    pub fn resolution_interval(&self) -> Duration {
        Duration::from_millis(self.resolution_interval_ms)
    }
    pub fn probing_timeout(&self) -> Duration {
        Duration::from_millis(self.probing_timeout_ms)
    }
    pub fn probing_interval(&self) -> Duration {
        Duration::from_millis(self.probing_interval_ms)
    }
    pub fn querying_delay(&self) -> Duration {
        Duration::from_millis(self.querying_delay_ms)
    }
    pub fn querying_interval(&self) -> Duration {
        Duration::from_millis(self.querying_interval_ms)
    }
    pub fn querying_max_interval(&self) -> Duration {
        Duration::from_millis(self.querying_max_interval_ms)
    }
    pub fn announcement_interval(&self) -> Duration {
        Duration::from_millis(self.announcement_interval_ms)
    }
    pub fn cancellation_interval(&self) -> Duration {
        Duration::from_millis(self.cancellation_interval_ms)
    }
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }
    pub fn ttl_default(&self) -> Duration {
        Duration::from_secs(self.ttl_default_secs as u64)
    }
    pub fn ttl_expiry(&self) -> Duration {
        Duration::from_secs(self.ttl_expiry_secs as u64)
    }

    /// Overlays process environment variables onto a base config, one
    /// `std::env::var` lookup per field.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("MDNS_PORT") {
            if let Ok(port) = v.parse() {
                config.port = port;
            }
        }
        if let Ok(v) = std::env::var("MDNS_IPV4_GROUP") {
            config.ipv4_group = v;
        }
        if let Ok(v) = std::env::var("MDNS_IPV6_GROUP") {
            config.ipv6_group = v;
        }
        if let Ok(v) = std::env::var("MDNS_RESOLUTION_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                config.resolution_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("MDNS_PROBING_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                config.probing_timeout_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("MDNS_TTL_DEFAULT_SECS") {
            if let Ok(secs) = v.parse() {
                config.ttl_default_secs = secs;
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = MdnsConfig::default();
        assert_eq!(c.ipv4_group, "224.0.0.251");
        assert_eq!(c.ipv6_group, "FF02::FB");
        assert_eq!(c.port, 5353);
        assert_eq!(c.resolution_timeout_ms, 6000);
        assert_eq!(c.probing_number, 3);
        assert_eq!(c.ttl_default_secs, 3600);
        assert_eq!(c.ttl_expiry_secs, 1);
    }

    #[test]
    fn json_roundtrip_with_partial_overrides() {
        let json = r#"{"port": 5354, "probing_number": 1}"#;
        let config: MdnsConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 5354);
        assert_eq!(config.probing_number, 1);
        assert_eq!(config.ttl_default_secs, 3600);
    }
}
