// One (topic, channel) binding: a control task that owns the connection
// map and serializes everything that mutates it.
//
// The reader tasks and the user-facing API never touch subscription state
// directly; both feed events into the control task's single channel. That
// turns reconcile, RDY accounting, backoff transitions, and FIN/REQ
// writes into single-consumer work with no shared lock.
use metrics::{counter, gauge};
use norq_wire::Command;
use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::config::{ClientConfig, CLS_DRAIN_TIMEOUT_MILLIS, SUBSCRIPTION_QUEUE_DEPTH};
use crate::conn::{ConnEvent, SubConnection};
use crate::host::HostAndPort;
use crate::subscriber::handler::{FailedMessageHandler, Message, MessageHandler};
use crate::subscriber::SubscriptionId;

/// Everything the control task reacts to: user commands, connection
/// events, handler completions, and backoff timers.
pub(crate) enum Event {
    Reconcile {
        nodes: HashSet<HostAndPort>,
        done: Option<oneshot::Sender<()>>,
    },
    SetMaxInFlight {
        max_in_flight: usize,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
    Conn(ConnEvent),
    HandlerDone {
        addr: HostAndPort,
        message: Message,
        success: bool,
    },
    BackoffExpired {
        generation: u64,
    },
}

#[derive(Clone)]
pub(crate) struct SubscriptionHandle {
    pub(crate) id: SubscriptionId,
    pub(crate) topic: String,
    pub(crate) channel: String,
    pub(crate) tx: mpsc::Sender<Event>,
    pub(crate) in_flight: Arc<AtomicUsize>,
    pub(crate) connections: Arc<AtomicUsize>,
}

pub(crate) struct SpawnParams {
    pub(crate) id: SubscriptionId,
    pub(crate) topic: String,
    pub(crate) channel: String,
    pub(crate) max_in_flight: usize,
    pub(crate) handler: Arc<dyn MessageHandler>,
    pub(crate) failed_handler: Option<Arc<dyn FailedMessageHandler>>,
    pub(crate) config: ClientConfig,
}

pub(crate) fn spawn(params: SpawnParams) -> SubscriptionHandle {
    let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_DEPTH);
    let handle = SubscriptionHandle {
        id: params.id,
        topic: params.topic.clone(),
        channel: params.channel.clone(),
        tx: tx.clone(),
        in_flight: Arc::new(AtomicUsize::new(0)),
        connections: Arc::new(AtomicUsize::new(0)),
    };
    let task = SubscriptionTask {
        topic: params.topic,
        channel: params.channel,
        config: params.config,
        handler: params.handler,
        failed_handler: params.failed_handler,
        max_in_flight: params.max_in_flight,
        connections: HashMap::new(),
        closing: Vec::new(),
        in_flight: Arc::clone(&handle.in_flight),
        conn_count: Arc::clone(&handle.connections),
        backoff: BackoffState::Normal,
        consecutive_failures: 0,
        generation: 0,
        rotation: 0,
        events_tx: tx,
    };
    tokio::spawn(task.run(rx));
    handle
}

enum BackoffState {
    Normal,
    /// All RDY at zero until the timer fires.
    Backoff,
    /// RDY 1 on exactly one connection, probing for recovery.
    Test { probe: HostAndPort },
}

struct SubscriptionTask {
    topic: String,
    channel: String,
    config: ClientConfig,
    handler: Arc<dyn MessageHandler>,
    failed_handler: Option<Arc<dyn FailedMessageHandler>>,
    max_in_flight: usize,
    connections: HashMap<HostAndPort, SubConnection>,
    /// Departed connections draining their in-flight messages. CLS has
    /// been sent; the write half stays alive so late FIN/REQ still land.
    closing: Vec<SubConnection>,
    in_flight: Arc<AtomicUsize>,
    conn_count: Arc<AtomicUsize>,
    backoff: BackoffState,
    consecutive_failures: u32,
    /// Invalidates stale backoff timers.
    generation: u64,
    /// Cursor for the RDY=1 rotation and for probe selection.
    rotation: usize,
    events_tx: mpsc::Sender<Event>,
}

impl SubscriptionTask {
    async fn run(mut self, mut rx: mpsc::Receiver<Event>) {
        while let Some(event) = rx.recv().await {
            match event {
                Event::Reconcile { nodes, done } => {
                    self.reconcile(nodes).await;
                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
                Event::SetMaxInFlight { max_in_flight } => {
                    self.max_in_flight = max_in_flight;
                    self.redistribute().await;
                }
                Event::Stop { done } => {
                    self.shutdown(&mut rx).await;
                    let _ = done.send(());
                    return;
                }
                Event::Conn(ConnEvent::Message { addr, frame }) => {
                    self.on_message(addr, Message::from_frame(frame)).await;
                }
                Event::Conn(ConnEvent::Heartbeat { addr }) => {
                    if let Some(conn) = self.writer_for(&addr) {
                        let _ = conn.send(Command::Nop).await;
                    }
                }
                Event::Conn(ConnEvent::Closed { addr, cause }) => {
                    self.on_closed(addr, cause).await;
                }
                Event::HandlerDone {
                    addr,
                    message,
                    success,
                } => {
                    self.on_handler_done(addr, message, success).await;
                }
                Event::BackoffExpired { generation } => {
                    self.on_backoff_expired(generation).await;
                }
            }
        }
    }

    /// Make the connection map match the discovered node set: open what is
    /// missing, gracefully close what is gone, rebalance the rest.
    async fn reconcile(&mut self, nodes: HashSet<HostAndPort>) {
        let departed: Vec<HostAndPort> = self
            .connections
            .keys()
            .filter(|addr| !nodes.contains(addr))
            .cloned()
            .collect();
        for addr in departed {
            if let Some(mut conn) = self.connections.remove(&addr) {
                tracing::info!(
                    node = %addr,
                    topic = %self.topic,
                    channel = %self.channel,
                    "closing subscription connection no longer in discovery"
                );
                let _ = conn.send(Command::Cls).await;
                self.closing.push(conn);
            }
        }

        for addr in nodes {
            if self.connections.contains_key(&addr) {
                continue;
            }
            match SubConnection::open(
                addr.clone(),
                &self.topic,
                &self.channel,
                &self.config,
                self.events_tx.clone(),
            )
            .await
            {
                Ok(conn) => {
                    tracing::info!(
                        node = %addr,
                        topic = %self.topic,
                        channel = %self.channel,
                        "subscription connection added"
                    );
                    self.connections.insert(addr, conn);
                }
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        node = %addr,
                        topic = %self.topic,
                        "failed to open subscription connection"
                    );
                }
            }
        }

        self.conn_count
            .store(self.connections.len(), Ordering::Relaxed);
        self.reap_closing();
        self.redistribute().await;
    }

    async fn on_message(&mut self, addr: HostAndPort, message: Message) {
        if !self.connections.contains_key(&addr) {
            // Raced with connection removal; the broker re-delivers after
            // its own timeout.
            tracing::debug!(node = %addr, id = %message.id(), "dropping message from removed connection");
            return;
        }
        if self.max_in_flight == 0 {
            // Draining: hand the message straight back.
            if let Some(conn) = self.writer_for(&addr) {
                let _ = conn
                    .send(Command::Req {
                        id: message.id(),
                        delay_ms: 0,
                    })
                    .await;
            }
            return;
        }

        counter!("norq_messages_received_total", "topic" => self.topic.clone()).increment(1);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        self.update_in_flight_gauge();

        let handler = Arc::clone(&self.handler);
        let events_tx = self.events_tx.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let done_addr = addr.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(&message)));
            let success = matches!(outcome, Ok(Ok(())));
            match &outcome {
                Ok(Err(err)) => {
                    tracing::warn!(error = %err, id = %message.id(), "message handler failed")
                }
                Err(_) => tracing::warn!(id = %message.id(), "message handler panicked"),
                Ok(Ok(())) => {}
            }
            in_flight.fetch_sub(1, Ordering::Relaxed);
            let _ = events_tx.blocking_send(Event::HandlerDone {
                addr: done_addr,
                message,
                success,
            });
        });

        let replenish = matches!(self.backoff, BackoffState::Normal);
        if let Some(conn) = self.connections.get_mut(&addr) {
            conn.in_flight += 1;
            conn.rdy_remaining = conn.rdy_remaining.saturating_sub(1);
            // Top the broker's credit back up before it runs dry.
            if replenish && conn.rdy_target > 0 && conn.rdy_remaining <= conn.rdy_target / 2 {
                conn.rdy_remaining = conn.rdy_target;
                let _ = conn.send(Command::Rdy(conn.rdy_target)).await;
            }
        }
    }

    async fn on_handler_done(&mut self, addr: HostAndPort, message: Message, success: bool) {
        if let Some(conn) = self.writer_for(&addr) {
            conn.in_flight = conn.in_flight.saturating_sub(1);
        }
        if success {
            counter!("norq_messages_finished_total", "topic" => self.topic.clone()).increment(1);
            if let Some(conn) = self.writer_for(&addr) {
                let _ = conn.send(Command::Fin(message.id())).await;
            }
            self.on_handler_success(&addr).await;
        } else if message.attempts() >= self.config.max_attempts {
            counter!("norq_messages_dead_lettered_total", "topic" => self.topic.clone())
                .increment(1);
            tracing::warn!(
                id = %message.id(),
                attempts = message.attempts(),
                topic = %self.topic,
                "giving up on message after max attempts"
            );
            if let Some(failed_handler) = self.failed_handler.clone() {
                failed_handler.failed(&message);
            }
            if let Some(conn) = self.writer_for(&addr) {
                let _ = conn.send(Command::Fin(message.id())).await;
            }
            self.on_handler_failure().await;
        } else {
            let delay = requeue_delay(message.attempts(), self.config.max_flush_delay());
            counter!("norq_messages_requeued_total", "topic" => self.topic.clone()).increment(1);
            tracing::debug!(
                id = %message.id(),
                attempts = message.attempts(),
                delay_ms = delay.as_millis() as u64,
                "requeueing failed message"
            );
            if let Some(conn) = self.writer_for(&addr) {
                let _ = conn
                    .send(Command::Req {
                        id: message.id(),
                        delay_ms: delay.as_millis() as u64,
                    })
                    .await;
            }
            self.on_handler_failure().await;
        }
        self.reap_closing();
        self.update_in_flight_gauge();
    }

    async fn on_handler_success(&mut self, addr: &HostAndPort) {
        // Only a success on the probe connection ends the test; anything
        // else is a straggler from before the pause and merely resets the
        // doubling so the next failure starts over from the base.
        let resume = match &self.backoff {
            BackoffState::Normal => return,
            BackoffState::Backoff => false,
            BackoffState::Test { probe } => probe == addr,
        };
        self.consecutive_failures = 0;
        if !resume {
            return;
        }
        self.backoff = BackoffState::Normal;
        tracing::info!(
            topic = %self.topic,
            channel = %self.channel,
            "handler recovered, resuming delivery"
        );
        self.redistribute().await;
    }

    async fn on_handler_failure(&mut self) {
        if matches!(self.backoff, BackoffState::Backoff) {
            return;
        }
        self.consecutive_failures += 1;
        let delay = backoff_duration(
            self.config.backoff_base(),
            self.consecutive_failures,
            self.config.backoff_ceiling(),
        );
        self.backoff = BackoffState::Backoff;
        self.generation += 1;
        tracing::warn!(
            topic = %self.topic,
            channel = %self.channel,
            failures = self.consecutive_failures,
            delay_ms = delay.as_millis() as u64,
            "pausing delivery after handler failure"
        );
        let generation = self.generation;
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events_tx.send(Event::BackoffExpired { generation }).await;
        });
        self.redistribute().await;
    }

    async fn on_backoff_expired(&mut self, generation: u64) {
        if generation != self.generation || !matches!(self.backoff, BackoffState::Backoff) {
            return;
        }
        let mut addrs: Vec<HostAndPort> = self.connections.keys().cloned().collect();
        if addrs.is_empty() {
            self.backoff = BackoffState::Normal;
            return;
        }
        addrs.sort();
        let probe = addrs[self.rotation % addrs.len()].clone();
        self.rotation = self.rotation.wrapping_add(1);
        tracing::info!(
            topic = %self.topic,
            channel = %self.channel,
            node = %probe,
            "probing for recovery"
        );
        self.backoff = BackoffState::Test { probe };
        self.redistribute().await;
    }

    async fn on_closed(&mut self, addr: HostAndPort, cause: String) {
        if self.connections.remove(&addr).is_some() {
            tracing::warn!(
                node = %addr,
                topic = %self.topic,
                channel = %self.channel,
                cause = %cause,
                "subscription connection closed"
            );
            self.conn_count
                .store(self.connections.len(), Ordering::Relaxed);
            if matches!(&self.backoff, BackoffState::Test { probe } if *probe == addr) {
                // The probe vanished; pick another one.
                self.backoff = BackoffState::Backoff;
                let generation = self.generation;
                self.on_backoff_expired(generation).await;
            } else {
                self.redistribute().await;
            }
        } else if let Some(position) = self.closing.iter().position(|conn| conn.addr == addr) {
            self.closing.remove(position);
        }
    }

    /// Spread `max_in_flight` across the current connections according to
    /// the backoff state, applying decreases before increases so the RDY
    /// sum never overshoots.
    async fn redistribute(&mut self) {
        let mut addrs: Vec<HostAndPort> = self.connections.keys().cloned().collect();
        addrs.sort();
        let targets: Vec<(HostAndPort, u32)> = match &self.backoff {
            BackoffState::Backoff => addrs.into_iter().map(|addr| (addr, 0)).collect(),
            BackoffState::Test { probe } => {
                // Drain wins over the recovery probe.
                let probe = probe.clone();
                let draining = self.max_in_flight == 0;
                addrs
                    .into_iter()
                    .map(|addr| {
                        let rdy = u32::from(!draining && addr == probe);
                        (addr, rdy)
                    })
                    .collect()
            }
            BackoffState::Normal => {
                let shares = distribute(self.max_in_flight, addrs.len(), self.rotation);
                if self.max_in_flight > 0 && self.max_in_flight < addrs.len() {
                    // Rotate the RDY=1 window so no connection starves.
                    self.rotation = self.rotation.wrapping_add(1);
                }
                addrs.into_iter().zip(shares).collect()
            }
        };
        let (decreases, increases): (Vec<_>, Vec<_>) = targets
            .into_iter()
            .partition(|(addr, target)| self.is_decrease(addr, *target));
        for (addr, target) in decreases.into_iter().chain(increases) {
            self.apply_rdy(&addr, target).await;
        }
    }

    fn is_decrease(&self, addr: &HostAndPort, target: u32) -> bool {
        self.connections
            .get(addr)
            .map_or(false, |conn| target < conn.rdy_target)
    }

    async fn apply_rdy(&mut self, addr: &HostAndPort, target: u32) {
        if let Some(conn) = self.connections.get_mut(addr) {
            if conn.rdy_target == target && conn.rdy_remaining == target {
                return;
            }
            conn.rdy_target = target;
            conn.rdy_remaining = target;
            let _ = conn.send(Command::Rdy(target)).await;
        }
    }

    fn writer_for(&mut self, addr: &HostAndPort) -> Option<&mut SubConnection> {
        if self.connections.contains_key(addr) {
            return self.connections.get_mut(addr);
        }
        self.closing.iter_mut().find(|conn| &conn.addr == addr)
    }

    fn reap_closing(&mut self) {
        self.closing.retain(|conn| conn.in_flight > 0);
    }

    fn update_in_flight_gauge(&self) {
        gauge!(
            "norq_in_flight_messages",
            "topic" => self.topic.clone(),
            "channel" => self.channel.clone()
        )
        .set(self.in_flight.load(Ordering::Relaxed) as f64);
    }

    /// Graceful stop: CLS everywhere, give brokers a short window to
    /// acknowledge, then drop whatever is left.
    async fn shutdown(&mut self, rx: &mut mpsc::Receiver<Event>) {
        let mut pending: HashSet<HostAndPort> = HashSet::new();
        for (addr, conn) in self.connections.iter_mut() {
            if conn.send(Command::Cls).await.is_ok() {
                pending.insert(addr.clone());
            }
        }
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(CLS_DRAIN_TIMEOUT_MILLIS);
        while !pending.is_empty() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(Event::Conn(ConnEvent::Closed { addr, .. }))) => {
                    pending.remove(&addr);
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        self.connections.clear();
        self.closing.clear();
        self.conn_count.store(0, Ordering::Relaxed);
        tracing::info!(
            topic = %self.topic,
            channel = %self.channel,
            "subscription stopped"
        );
    }
}

/// RDY share per connection, in stable (sorted-address) order.
fn distribute(max_in_flight: usize, connections: usize, rotation: usize) -> Vec<u32> {
    let mut shares = vec![0u32; connections];
    if connections == 0 || max_in_flight == 0 {
        return shares;
    }
    if max_in_flight < connections {
        // Not enough credit for everyone: a rotating window gets RDY 1.
        for offset in 0..max_in_flight {
            shares[(rotation + offset) % connections] = 1;
        }
    } else {
        let base = (max_in_flight / connections) as u32;
        let remainder = max_in_flight % connections;
        for (index, share) in shares.iter_mut().enumerate() {
            *share = base + u32::from(index < remainder);
        }
    }
    shares
}

/// Doubling delivery pause, capped.
fn backoff_duration(base: Duration, consecutive_failures: u32, ceiling: Duration) -> Duration {
    let exponent = consecutive_failures.saturating_sub(1).min(20);
    base.checked_mul(1u32 << exponent)
        .map_or(ceiling, |delay| delay.min(ceiling))
}

/// Requeue delay for a failed message: doubling by broker-side attempt
/// count, bounded by the configured flush-delay cap.
fn requeue_delay(attempts: u16, max_flush_delay: Duration) -> Duration {
    let exponent = u32::from(attempts.saturating_sub(1)).min(20);
    Duration::from_millis(1000)
        .checked_mul(1u32 << exponent)
        .map_or(max_flush_delay, |delay| delay.min(max_flush_delay))
}
