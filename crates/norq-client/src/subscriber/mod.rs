//! Topic/channel consumption: discovery polling, the subscription
//! registry, and the drain/await surface.
//!
//! # Design notes
//! Each subscription runs as its own control task; the subscriber only
//! keeps lightweight handles (command sender plus shared counters), so
//! none of the public calls contend with message delivery.
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::config::{ClientConfig, AWAIT_IN_FLIGHT_POLL_MILLIS, DEFAULT_LOOKUPD_PORT};
use crate::error::{Error, Result};
use crate::host::HostAndPort;

pub mod handler;
pub(crate) mod lookup;
pub(crate) mod subscription;

use handler::{FailedMessageHandler, MessageHandler};
use lookup::LookupClient;
use subscription::{Event, SpawnParams, SubscriptionHandle};

/// Opaque identity of one subscription, stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Consumes topics via periodic discovery against the lookup service.
///
/// Construct with [`Subscriber::new`]; the returned `Arc` is the handle
/// shared with the background discovery task. All runtime faults after
/// construction are handled internally (logged, marked, backed off);
/// nothing surfaces through this API except argument validation.
pub struct Subscriber {
    config: ClientConfig,
    lookup: LookupClient,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
    id_counter: AtomicU64,
    stopped: AtomicBool,
    poll_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    failed_handler: std::sync::Mutex<Option<Arc<dyn FailedMessageHandler>>>,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Subscriber {
    /// Create a subscriber polling the given lookup hosts (`host` or
    /// `host:port`, default port 4161). Must be called from within a
    /// tokio runtime.
    pub fn new(config: ClientConfig, lookup_hosts: &[&str]) -> Result<Arc<Self>> {
        if lookup_hosts.is_empty() {
            return Err(Error::InvalidArgument("at least one lookup host"));
        }
        let mut hosts = Vec::with_capacity(lookup_hosts.len());
        for host in lookup_hosts {
            hosts.push(HostAndPort::parse(host, DEFAULT_LOOKUPD_PORT)?);
        }
        let lookup = LookupClient::new(hosts, &config)?;
        let interval = Duration::from_secs(config.lookup_interval_secs.max(1));
        let subscriber = Arc::new(Self {
            config,
            lookup,
            subscriptions: Mutex::new(Vec::new()),
            id_counter: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            poll_task: std::sync::Mutex::new(None),
            failed_handler: std::sync::Mutex::new(None),
        });
        let task = tokio::spawn(run_lookup_loop(Arc::downgrade(&subscriber), interval));
        *subscriber.poll_task.lock().expect("poll task lock") = Some(task);
        Ok(subscriber)
    }

    /// Subscribe with the configured default max-in-flight.
    pub async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        handler: impl MessageHandler,
    ) -> Result<SubscriptionId> {
        let max_in_flight = self.config.default_max_in_flight;
        self.subscribe_with_max_in_flight(topic, channel, max_in_flight, handler)
            .await
    }

    /// Subscribe, performing one immediate discovery round for the topic
    /// so connections exist before this returns.
    pub async fn subscribe_with_max_in_flight(
        &self,
        topic: &str,
        channel: &str,
        max_in_flight: usize,
        handler: impl MessageHandler,
    ) -> Result<SubscriptionId> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Closed("subscriber stopped"));
        }
        if !norq_wire::valid_name(topic) {
            return Err(Error::InvalidArgument("invalid topic name"));
        }
        if !norq_wire::valid_name(channel) {
            return Err(Error::InvalidArgument("invalid channel name"));
        }

        let id = SubscriptionId(self.id_counter.fetch_add(1, Ordering::Relaxed) + 1);
        let failed_handler = self
            .failed_handler
            .lock()
            .expect("failed handler lock")
            .clone();
        let handle = subscription::spawn(SpawnParams {
            id,
            topic: topic.to_string(),
            channel: channel.to_string(),
            max_in_flight,
            handler: Arc::new(handler),
            failed_handler,
            config: self.config.clone(),
        });
        let tx = handle.tx.clone();
        self.subscriptions.lock().await.push(handle);

        let nodes = self.lookup.lookup_topic(topic).await;
        let (done, reconciled) = oneshot::channel();
        if tx
            .send(Event::Reconcile {
                nodes,
                done: Some(done),
            })
            .await
            .is_ok()
        {
            let _ = reconciled.await;
        }
        tracing::info!(topic, channel, id = %id, "subscribed");
        Ok(id)
    }

    /// Stop a subscription and close its connections. Returns whether the
    /// id was known.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let handle = {
            let mut subscriptions = self.subscriptions.lock().await;
            match subscriptions.iter().position(|handle| handle.id == id) {
                Some(index) => Some(subscriptions.remove(index)),
                None => None,
            }
        };
        let Some(handle) = handle else {
            return false;
        };
        stop_subscription(&handle.tx).await;
        tracing::info!(id = %id, topic = %handle.topic, "unsubscribed");
        true
    }

    /// Apply a new max-in-flight to every subscription on (topic, channel).
    pub async fn set_max_in_flight(&self, topic: &str, channel: &str, max_in_flight: usize) {
        let subscriptions = self.subscriptions.lock().await;
        for handle in subscriptions.iter() {
            if handle.topic == topic && handle.channel == channel {
                let _ = handle.tx.send(Event::SetMaxInFlight { max_in_flight }).await;
            }
        }
    }

    /// Set every subscription's max-in-flight to zero. Existing in-flight
    /// messages drain; nothing new is delivered until a
    /// [`Subscriber::set_max_in_flight`] call raises the limit again.
    /// Connections discovered while draining also start at zero.
    pub async fn drain_in_flight(&self) {
        let subscriptions = self.subscriptions.lock().await;
        for handle in subscriptions.iter() {
            let _ = handle
                .tx
                .send(Event::SetMaxInFlight { max_in_flight: 0 })
                .await;
        }
        tracing::info!("draining all subscriptions");
    }

    /// Messages currently owned by handlers, summed across subscriptions.
    pub async fn current_in_flight(&self) -> usize {
        let subscriptions = self.subscriptions.lock().await;
        subscriptions
            .iter()
            .map(|handle| handle.in_flight.load(Ordering::Relaxed))
            .sum()
    }

    /// Open broker connections, summed across subscriptions.
    pub async fn connection_count(&self) -> usize {
        let subscriptions = self.subscriptions.lock().await;
        subscriptions
            .iter()
            .map(|handle| handle.connections.load(Ordering::Relaxed))
            .sum()
    }

    /// Poll every 500ms until no messages are in flight or the timeout
    /// elapses; returns whether the count reached zero.
    pub async fn await_no_messages_in_flight(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let current = self.current_in_flight().await;
            if current == 0 {
                tracing::info!("in-flight count reached 0");
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    current,
                    "gave up waiting for in-flight messages to drain"
                );
                return false;
            }
            tracing::debug!(current, "awaiting in-flight messages");
            tokio::time::sleep(Duration::from_millis(AWAIT_IN_FLIGHT_POLL_MILLIS)).await;
        }
    }

    /// Callback for messages that exhaust `max_attempts`. Applies to
    /// subscriptions created after this call.
    pub fn set_failed_message_handler(&self, handler: impl FailedMessageHandler) {
        *self.failed_handler.lock().expect("failed handler lock") = Some(Arc::new(handler));
    }

    /// Stop discovery, close every subscription, clear the registry.
    /// Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.poll_task.lock().expect("poll task lock").take() {
            task.abort();
        }
        let handles: Vec<SubscriptionHandle> =
            self.subscriptions.lock().await.drain(..).collect();
        for handle in handles {
            stop_subscription(&handle.tx).await;
        }
        tracing::info!("subscriber stopped");
    }

    /// One discovery round: resolve every active topic and hand each
    /// subscription its node set.
    async fn poll_once(&self) {
        let targets: Vec<(String, mpsc::Sender<Event>)> = {
            let subscriptions = self.subscriptions.lock().await;
            subscriptions
                .iter()
                .map(|handle| (handle.topic.clone(), handle.tx.clone()))
                .collect()
        };
        let mut resolved: Vec<(String, HashSet<HostAndPort>)> = Vec::new();
        for (topic, tx) in targets {
            let nodes = match resolved.iter().find(|(seen, _)| *seen == topic) {
                Some((_, nodes)) => nodes.clone(),
                None => {
                    let nodes = self.lookup.lookup_topic(&topic).await;
                    resolved.push((topic.clone(), nodes.clone()));
                    nodes
                }
            };
            let _ = tx.send(Event::Reconcile { nodes, done: None }).await;
        }
    }
}

async fn stop_subscription(tx: &mpsc::Sender<Event>) {
    let (done, stopped) = oneshot::channel();
    if tx.send(Event::Stop { done }).await.is_ok() {
        let _ = stopped.await;
    }
}

async fn run_lookup_loop(subscriber: Weak<Subscriber>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(subscriber) = subscriber.upgrade() else {
            return;
        };
        if subscriber.stopped.load(Ordering::SeqCst) {
            return;
        }
        subscriber.poll_once().await;
    }
}
