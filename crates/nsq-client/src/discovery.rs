//! Periodic nsqlookupd polling.
//!
//! One query per `poll_interval / replica_count` tick, rotating through the
//! configured addresses, so replicas are fanned out over the interval
//! instead of hit simultaneously. Fetch errors are logged and never touch
//! existing connections.
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Default, Deserialize)]
struct LookupResponse {
    // nsqlookupd < 1.0 wraps the body in a top-level `data` object.
    #[serde(default)]
    data: Option<ProducerList>,
    #[serde(default)]
    producers: Vec<Producer>,
}

#[derive(Debug, Default, Deserialize)]
struct ProducerList {
    #[serde(default)]
    producers: Vec<Producer>,
}

#[derive(Debug, Deserialize)]
struct Producer {
    #[serde(default)]
    broadcast_address: Option<String>,
    // Pre-1.0 field name.
    #[serde(default)]
    address: Option<String>,
    tcp_port: u16,
}

pub(crate) struct PollerConfig {
    pub(crate) addresses: Vec<String>,
    pub(crate) topic: String,
    pub(crate) poll_interval: Duration,
    pub(crate) poll_jitter: f64,
    pub(crate) request_timeout: Duration,
}

pub(crate) fn spawn_poller(
    config: PollerConfig,
    sink: mpsc::UnboundedSender<Vec<String>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run_poller(config, sink))
}

async fn run_poller(config: PollerConfig, sink: mpsc::UnboundedSender<Vec<String>>) {
    let client = match reqwest::Client::builder()
        .timeout(config.request_timeout)
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            warn!(error = %e, "failed to build lookupd http client");
            return;
        }
    };

    // Randomize the start so a fleet of restarted consumers does not query
    // in lockstep.
    let jitter = config
        .poll_interval
        .mul_f64(rand::random_range(0.0..=1.0) * config.poll_jitter.clamp(0.0, 1.0));
    if !jitter.is_zero() {
        tokio::time::sleep(jitter).await;
    }

    let tick = config.poll_interval / config.addresses.len().max(1) as u32;
    let mut index = 0usize;
    loop {
        let endpoint = &config.addresses[index % config.addresses.len()];
        index = index.wrapping_add(1);
        match query(&client, endpoint, &config.topic).await {
            Ok(producers) => {
                debug!(lookupd = %endpoint, count = producers.len(), "lookup");
                if sink.send(producers).is_err() {
                    return;
                }
            }
            Err(e) => warn!(lookupd = %endpoint, error = %e, "lookupd query failed"),
        }
        tokio::time::sleep(tick).await;
    }
}

async fn query(
    client: &reqwest::Client,
    endpoint: &str,
    topic: &str,
) -> std::result::Result<Vec<String>, reqwest::Error> {
    let base = if endpoint.contains("://") {
        endpoint.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", endpoint.trim_end_matches('/'))
    };
    let response = client
        .get(format!("{base}/lookup"))
        .query(&[("topic", topic)])
        .header("Accept", "application/vnd.nsq; version=1.0")
        .send()
        .await?
        .error_for_status()?;
    let body: LookupResponse = response.json().await?;
    Ok(producer_addresses(body))
}

fn producer_addresses(body: LookupResponse) -> Vec<String> {
    let producers = match body.data {
        Some(data) => data.producers,
        None => body.producers,
    };
    producers
        .into_iter()
        .filter_map(|p| {
            let host = p.broadcast_address.or(p.address)?;
            Some(format!("{host}:{}", p.tcp_port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flat_response() {
        let body: LookupResponse = serde_json::from_str(
            r#"{"channels":["archive"],"producers":[
                {"broadcast_address":"nsq1.local","tcp_port":4150,"http_port":4151},
                {"broadcast_address":"nsq2.local","tcp_port":4150}
            ]}"#,
        )
        .expect("json");
        assert_eq!(
            producer_addresses(body),
            vec!["nsq1.local:4150", "nsq2.local:4150"]
        );
    }

    #[test]
    fn parses_legacy_data_wrapper() {
        let body: LookupResponse = serde_json::from_str(
            r#"{"status_code":200,"status_txt":"OK","data":{
                "producers":[{"broadcast_address":"nsq1.local","tcp_port":4150}]
            }}"#,
        )
        .expect("json");
        assert_eq!(producer_addresses(body), vec!["nsq1.local:4150"]);
    }

    #[test]
    fn falls_back_to_the_legacy_address_field() {
        let body: LookupResponse = serde_json::from_str(
            r#"{"producers":[{"address":"old.local","tcp_port":4150}]}"#,
        )
        .expect("json");
        assert_eq!(producer_addresses(body), vec!["old.local:4150"]);
    }

    #[test]
    fn skips_producers_without_an_address() {
        let body: LookupResponse =
            serde_json::from_str(r#"{"producers":[{"tcp_port":4150}]}"#).expect("json");
        assert!(producer_addresses(body).is_empty());
    }
}
