// Explicit client value: shared configuration plus teardown of every
// component built through it.
//
// There is deliberately no implicit process-wide state: callers construct
// a `Client` and pass it around. `Client::shared` exists for the old
// one-client-per-process ergonomics, but teardown stays explicit.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Mutex;

use crate::config::{ClientConfig, DEFAULT_NSQD_PORT};
use crate::error::{Error, Result};
use crate::host::HostAndPort;
use crate::publisher::Publisher;
use crate::subscriber::Subscriber;

static SHARED: OnceLock<Client> = OnceLock::new();

pub struct Client {
    config: ClientConfig,
    publishers: Mutex<Vec<Arc<Publisher>>>,
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    stopped: AtomicBool,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            publishers: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Lazily initialized process-wide instance, configured from the
    /// environment. Call [`Client::stop`] on it for teardown.
    pub fn shared() -> &'static Client {
        SHARED.get_or_init(|| Client::new(ClientConfig::from_env()))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Build a publisher for the given broker nodes (`host` or
    /// `host:port`, default port 4150) and register it for teardown.
    pub async fn publisher(&self, nodes: &[&str]) -> Result<Arc<Publisher>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Closed("client stopped"));
        }
        let mut addrs = Vec::with_capacity(nodes.len());
        for node in nodes {
            addrs.push(HostAndPort::parse(node, DEFAULT_NSQD_PORT)?);
        }
        let publisher = Arc::new(Publisher::new(self.config.clone(), addrs));
        self.publishers.lock().await.push(Arc::clone(&publisher));
        Ok(publisher)
    }

    /// Build a subscriber polling the given lookup hosts and register it
    /// for teardown.
    pub async fn subscriber(&self, lookup_hosts: &[&str]) -> Result<Arc<Subscriber>> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Closed("client stopped"));
        }
        let subscriber = Subscriber::new(self.config.clone(), lookup_hosts)?;
        self.subscribers.lock().await.push(Arc::clone(&subscriber));
        Ok(subscriber)
    }

    /// Stop everything built through this client. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscribers: Vec<_> = self.subscribers.lock().await.drain(..).collect();
        for subscriber in subscribers {
            subscriber.stop().await;
        }
        let publishers: Vec<_> = self.publishers.lock().await.drain(..).collect();
        for publisher in publishers {
            publisher.stop().await;
        }
        tracing::info!("client stopped");
    }
}
