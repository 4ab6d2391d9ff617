// Discovery HTTP client: maps a topic to the broker nodes hosting it.
//
// Failure philosophy mirrors the rest of the client's control-plane
// polling: every fetch is best-effort, faults are logged and counted per
// URL, and polling never stops because of them.
use metrics::counter;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::host::HostAndPort;

pub(crate) struct LookupClient {
    http: reqwest::Client,
    hosts: Vec<HostAndPort>,
    /// url -> consecutive failure count; cleared on first success.
    failures: Mutex<HashMap<String, u32>>,
    error_threshold: u32,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LookupResponse {
    #[serde(default)]
    producers: Vec<Producer>,
    /// Legacy envelope: `{status_code, data: {producers}}`.
    #[serde(default)]
    data: Option<LookupData>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LookupData {
    #[serde(default)]
    producers: Vec<Producer>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Producer {
    broadcast_address: String,
    tcp_port: u16,
}

impl LookupResponse {
    fn into_nodes(self) -> impl Iterator<Item = HostAndPort> {
        let producers = match self.data {
            Some(data) => data.producers,
            None => self.producers,
        };
        producers
            .into_iter()
            .map(|producer| HostAndPort::new(producer.broadcast_address, producer.tcp_port))
    }
}

impl LookupClient {
    pub(crate) fn new(hosts: Vec<HostAndPort>, config: &ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.lookup_timeout())
            .timeout(config.lookup_timeout())
            .build()
            .map_err(|err| Error::Protocol(format!("build discovery http client: {err}")))?;
        Ok(Self {
            http,
            hosts,
            failures: Mutex::new(HashMap::new()),
            error_threshold: config.max_lookup_failures_before_error,
        })
    }

    /// Union of the producers every discovery host reports for `topic`.
    pub(crate) async fn lookup_topic(&self, topic: &str) -> HashSet<HostAndPort> {
        let mut nodes = HashSet::new();
        for host in &self.hosts {
            // Failure accounting is per (host, topic) query, so the key
            // carries both.
            let url = format!("http://{host}/lookup?topic={topic}");
            match self.fetch(host, topic).await {
                Ok(Some(producers)) => {
                    nodes.extend(producers);
                    self.failures.lock().expect("failures lock").remove(&url);
                }
                // Non-200: ignored, and deliberately not counted as a
                // failure; the counter tracks connectivity faults only.
                Ok(None) => {}
                Err(err) => self.note_failure(&url, host, topic, &err),
            }
        }
        nodes
    }

    async fn fetch(
        &self,
        host: &HostAndPort,
        topic: &str,
    ) -> std::result::Result<Option<Vec<HostAndPort>>, reqwest::Error> {
        let response = self
            .http
            .get(format!("http://{host}/lookup"))
            .query(&[("topic", topic)])
            .send()
            .await?;
        if !response.status().is_success() {
            tracing::debug!(
                status = %response.status(),
                nsqlookupd = %host,
                topic,
                "ignoring lookup response"
            );
            return Ok(None);
        }
        let body: LookupResponse = response.json().await?;
        Ok(Some(body.into_nodes().collect()))
    }

    fn note_failure(&self, url: &str, host: &HostAndPort, topic: &str, err: &reqwest::Error) {
        let consecutive = {
            let mut failures = self.failures.lock().expect("failures lock");
            let count = failures.entry(url.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        counter!("norq_lookup_failures_total").increment(1);
        if consecutive >= self.error_threshold {
            tracing::error!(
                error = %err,
                nsqlookupd = %host,
                topic,
                consecutive,
                "lookup failed"
            );
        } else {
            tracing::warn!(
                error = %err,
                nsqlookupd = %host,
                topic,
                consecutive,
                "lookup failed"
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn failure_count(&self, url: &str) -> u32 {
        self.failures
            .lock()
            .expect("failures lock")
            .get(url)
            .copied()
            .unwrap_or(0)
    }
}
