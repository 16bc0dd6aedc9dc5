//! Client configuration and the IDENTIFY feature handshake payloads.
use bytes::Bytes;
use nsq_transport::TlsOptions;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{Error, Result};

pub(crate) const DEFAULT_MAX_RDY_COUNT: u32 = 2500;
pub(crate) const RECONNECT_BASE: Duration = Duration::from_secs(15);
pub(crate) const RECONNECT_MAX: Duration = Duration::from_secs(60);
pub(crate) const CONNECT_THROTTLE: Duration = Duration::from_secs(10);
pub(crate) const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// All Reader/Writer knobs, including everything negotiated via IDENTIFY.
///
/// Validated once at construction; a bad combination is the only error the
/// constructors surface synchronously.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity metadata sent in IDENTIFY. Defaults to the short hostname.
    pub client_id: String,
    /// Defaults to the full hostname.
    pub hostname: String,
    pub user_agent: String,

    /// Requested server-to-client heartbeat period. `None` disables
    /// heartbeats (sent as `-1`).
    pub heartbeat_interval: Option<Duration>,
    /// Per-message broker visibility timeout; `None` keeps the server
    /// default.
    pub msg_timeout: Option<Duration>,
    pub dial_timeout: Duration,

    pub tls_v1: bool,
    pub tls_options: TlsOptions,
    pub snappy: bool,
    pub deflate: bool,
    pub deflate_level: u32,
    /// Broker-side write coalescing knobs.
    pub output_buffer_size: u64,
    pub output_buffer_timeout: Duration,
    /// 0-99; the broker delivers that percentage of channel messages.
    pub sample_rate: u8,
    pub auth_secret: Option<String>,

    /// Global RDY budget across all connections. 0 pauses the Reader.
    pub max_in_flight: u32,
    /// Attempt cap per message; 0 disables the cap.
    pub max_tries: u16,
    /// Base for the automatic requeue delay (`requeue_delay x attempts`).
    pub requeue_delay: Duration,

    pub lookupd_poll_interval: Duration,
    /// Fraction of the poll interval randomized into the first query.
    pub lookupd_poll_jitter: f64,
    pub lookupd_request_timeout: Duration,

    /// RDY redistribution period when `max_in_flight < connection count`.
    pub low_rdy_idle_timeout: Duration,
    /// How often the redistribution pass runs.
    pub rdy_redistribute_interval: Duration,

    pub backoff_enabled: bool,
    pub backoff_base: Duration,
    pub max_backoff_duration: Duration,

    pub max_frame_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        let hostname = hostname();
        let client_id = hostname.split('.').next().unwrap_or(&hostname).to_string();
        Self {
            client_id,
            hostname,
            user_agent: concat!("nsq-client/", env!("CARGO_PKG_VERSION")).to_string(),
            heartbeat_interval: Some(Duration::from_secs(30)),
            msg_timeout: None,
            dial_timeout: Duration::from_secs(1),
            tls_v1: false,
            tls_options: TlsOptions::default(),
            snappy: false,
            deflate: false,
            deflate_level: 6,
            output_buffer_size: 16 * 1024,
            output_buffer_timeout: Duration::from_millis(250),
            sample_rate: 0,
            auth_secret: None,
            max_in_flight: 1,
            max_tries: 5,
            requeue_delay: Duration::from_secs(90),
            lookupd_poll_interval: Duration::from_secs(60),
            lookupd_poll_jitter: 0.3,
            lookupd_request_timeout: Duration::from_secs(2),
            low_rdy_idle_timeout: Duration::from_secs(15),
            rdy_redistribute_interval: Duration::from_secs(5),
            backoff_enabled: true,
            backoff_base: Duration::from_secs(1),
            max_backoff_duration: Duration::from_secs(128),
            max_frame_bytes: nsq_wire::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.snappy && self.deflate {
            return Err(Error::Config(
                "snappy and deflate are mutually exclusive".into(),
            ));
        }
        if self.deflate_level > 9 {
            return Err(Error::Config(format!(
                "deflate_level must be 0-9, got {}",
                self.deflate_level
            )));
        }
        if self.sample_rate > 99 {
            return Err(Error::Config(format!(
                "sample_rate must be 0-99, got {}",
                self.sample_rate
            )));
        }
        if let Some(interval) = self.heartbeat_interval
            && interval < Duration::from_secs(1)
        {
            return Err(Error::Config("heartbeat_interval below 1s".into()));
        }
        if !(0.0..=1.0).contains(&self.lookupd_poll_jitter) {
            return Err(Error::Config(format!(
                "lookupd_poll_jitter must be within [0, 1], got {}",
                self.lookupd_poll_jitter
            )));
        }
        if self.lookupd_poll_interval < Duration::from_secs(1) {
            return Err(Error::Config("lookupd_poll_interval below 1s".into()));
        }
        if self.rdy_redistribute_interval.is_zero() {
            return Err(Error::Config("rdy_redistribute_interval must be non-zero".into()));
        }
        if self.backoff_enabled && self.backoff_base.is_zero() {
            return Err(Error::Config("backoff_base must be non-zero".into()));
        }
        if self.backoff_enabled && self.max_backoff_duration < self.backoff_base {
            return Err(Error::Config(
                "max_backoff_duration is shorter than backoff_base".into(),
            ));
        }
        Ok(())
    }

    /// The IDENTIFY body for one connection.
    pub(crate) fn identify_payload(&self) -> Result<Bytes> {
        let heartbeat_ms = match self.heartbeat_interval {
            Some(interval) => interval.as_millis() as i64,
            None => -1,
        };
        let mut body = serde_json::json!({
            "client_id": self.client_id,
            "hostname": self.hostname,
            "user_agent": self.user_agent,
            "feature_negotiation": true,
            "heartbeat_interval": heartbeat_ms,
            "tls_v1": self.tls_v1,
            "snappy": self.snappy,
            "deflate": self.deflate,
            "deflate_level": self.deflate_level,
            "output_buffer_size": self.output_buffer_size,
            "output_buffer_timeout": self.output_buffer_timeout.as_millis() as u64,
            "sample_rate": self.sample_rate,
        });
        if let Some(timeout) = self.msg_timeout {
            body["msg_timeout"] = serde_json::json!(timeout.as_millis() as u64);
        }
        let encoded = serde_json::to_vec(&body)
            .map_err(|e| Error::Config(format!("failed to encode IDENTIFY body: {e}")))?;
        Ok(Bytes::from(encoded))
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// The broker's negotiated feature set from the IDENTIFY response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentifyResponse {
    #[serde(default)]
    pub max_rdy_count: Option<u32>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub tls_v1: bool,
    #[serde(default)]
    pub snappy: bool,
    #[serde(default)]
    pub deflate: bool,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub output_buffer_size: Option<u64>,
    #[serde(default)]
    pub output_buffer_timeout: Option<u64>,
    #[serde(default)]
    pub msg_timeout: Option<u64>,
}

impl IdentifyResponse {
    /// Pre-0.2.20 brokers answer `OK` and negotiate nothing.
    pub(crate) fn legacy() -> Self {
        Self::default()
    }

    pub fn max_rdy_count(&self) -> u32 {
        self.max_rdy_count.unwrap_or(DEFAULT_MAX_RDY_COUNT)
    }
}

/// The broker's AUTH response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthResponse {
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub identity_url: String,
    #[serde(default)]
    pub permission_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().expect("valid");
    }

    #[test]
    fn rejects_both_compressors() {
        let config = Config {
            snappy: true,
            deflate: true,
            ..Config::default()
        };
        let err = config.validate().expect_err("exclusive");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_out_of_range_sample_rate() {
        let config = Config {
            sample_rate: 100,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn identify_payload_carries_negotiation_flag() {
        let config = Config {
            snappy: true,
            ..Config::default()
        };
        let body = config.identify_payload().expect("payload");
        let value: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(value["feature_negotiation"], true);
        assert_eq!(value["snappy"], true);
        assert_eq!(value["deflate"], false);
        assert_eq!(value["heartbeat_interval"], 30_000);
        assert!(value.get("msg_timeout").is_none());
    }

    #[test]
    fn disabled_heartbeat_is_minus_one() {
        let config = Config {
            heartbeat_interval: None,
            ..Config::default()
        };
        let value: serde_json::Value =
            serde_json::from_slice(&config.identify_payload().expect("payload")).expect("json");
        assert_eq!(value["heartbeat_interval"], -1);
    }

    #[test]
    fn identify_response_defaults_max_rdy() {
        let legacy = IdentifyResponse::legacy();
        assert_eq!(legacy.max_rdy_count(), DEFAULT_MAX_RDY_COUNT);

        let negotiated: IdentifyResponse =
            serde_json::from_str(r#"{"max_rdy_count":1000,"version":"1.2.1"}"#).expect("json");
        assert_eq!(negotiated.max_rdy_count(), 1000);
        assert!(!negotiated.auth_required);
    }
}
