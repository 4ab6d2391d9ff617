// Topic publishing with node failover and the atomic-vs-fallback batch
// policy.
use std::time::Duration;
use tokio::sync::Mutex;

use crate::balance::BalanceStrategy;
use crate::config::{ClientConfig, MARK_FAILURE_WINDOW_MILLIS};
use crate::conn::PubConnection;
use crate::error::{Error, Result};
use crate::host::HostAndPort;

/// Publishes messages to broker nodes.
///
/// Node selection, health marking, and connection bookkeeping live in the
/// balance strategy behind one lock; the publish round trip itself runs
/// on the connection worker, outside that lock.
pub struct Publisher {
    config: ClientConfig,
    strategy: Mutex<BalanceStrategy>,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher").finish_non_exhaustive()
    }
}

impl Publisher {
    pub fn new(config: ClientConfig, nodes: Vec<HostAndPort>) -> Self {
        Self {
            config,
            strategy: Mutex::new(BalanceStrategy::new(nodes)),
        }
    }

    /// Publish one message. On failure the node is marked unhealthy and
    /// the publish is retried once on a different node, when one exists.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        if !norq_wire::valid_name(topic) {
            return Err(Error::InvalidArgument("invalid topic name"));
        }
        self.publish_with_failover(topic, payload).await
    }

    /// Publish a batch as one MPUB command.
    ///
    /// In atomic mode an MPUB failure surfaces as
    /// [`Error::AtomicBatchPublishFailed`] and nothing else is attempted:
    /// the whole-or-nothing contract. Otherwise the batch falls back to
    /// per-message publishes in input order, and individual failures are
    /// logged rather than propagated.
    pub async fn publish_multi(&self, topic: &str, payloads: Vec<Vec<u8>>) -> Result<()> {
        if !norq_wire::valid_name(topic) {
            return Err(Error::InvalidArgument("invalid topic name"));
        }
        if payloads.is_empty() {
            return Err(Error::InvalidArgument("empty batch"));
        }

        let batch_size = payloads.len();
        let fallback = if self.config.atomic {
            None
        } else {
            Some(payloads.clone())
        };

        let addr = match self.pick(None).await? {
            Some(addr) => addr,
            None => return Err(Error::NoNodesAvailable),
        };
        let attempt = match self.connection_for(&addr).await {
            Ok(connection) => connection.publish_multi(topic, payloads).await,
            Err(err) => Err(err),
        };
        let cause = match attempt {
            Ok(()) => return Ok(()),
            Err(cause) => cause,
        };

        // One mark for the whole batch, whichever policy applies below.
        self.note_failure(&addr, &cause).await;
        match fallback {
            None => {
                tracing::error!(
                    error = %cause,
                    topic,
                    batch_size,
                    "atomic batch publish failed"
                );
                Err(Error::AtomicBatchPublishFailed {
                    batch_size,
                    cause: Box::new(cause),
                })
            }
            Some(payloads) => {
                tracing::warn!(
                    error = %cause,
                    topic,
                    batch_size,
                    "batch publish failed, falling back to per-message delivery"
                );
                for payload in payloads {
                    if let Err(err) = self.publish_with_failover(topic, payload).await {
                        tracing::warn!(
                            error = %err,
                            topic,
                            "dropping message after fallback publish failure"
                        );
                    }
                }
                Ok(())
            }
        }
    }

    /// Close every node connection. Safe to call more than once.
    pub async fn stop(&self) {
        self.strategy.lock().await.close_all().await;
        tracing::info!("publisher stopped");
    }

    async fn publish_with_failover(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let mut exclude: Option<HostAndPort> = None;
        let mut last_error: Option<Error> = None;
        for _ in 0..2 {
            let picked = self.pick(exclude.as_ref()).await?;
            let Some(addr) = picked else { break };
            let attempt = match self.connection_for(&addr).await {
                Ok(connection) => connection.publish(topic, payload.clone()).await,
                Err(err) => Err(err),
            };
            match attempt {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(error = %err, node = %addr, topic, "publish failed");
                    self.note_failure(&addr, &err).await;
                    exclude = Some(addr);
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or(Error::NoNodesAvailable))
    }

    async fn pick(&self, exclude: Option<&HostAndPort>) -> Result<Option<HostAndPort>> {
        self.strategy
            .lock()
            .await
            .pick(exclude, self.config.failure_backoff())
    }

    /// Get-or-open the node's connection. The handshake runs outside the
    /// strategy lock; a concurrent opener simply wins the install race.
    async fn connection_for(&self, addr: &HostAndPort) -> Result<PubConnection> {
        if let Some(connection) = self.strategy.lock().await.existing_connection(addr) {
            return Ok(connection);
        }
        let connection = PubConnection::open(addr.clone(), &self.config).await?;
        self.strategy
            .lock()
            .await
            .install_connection(addr, connection.clone());
        Ok(connection)
    }

    /// Health-mark the node; a broker NAK leaves the TCP connection
    /// intact, anything transport-level discards it so the next
    /// selection reconnects.
    async fn note_failure(&self, addr: &HostAndPort, cause: &Error) {
        let window = Duration::from_millis(MARK_FAILURE_WINDOW_MILLIS);
        let mut strategy = self.strategy.lock().await;
        if !matches!(cause, Error::Publish(_)) {
            strategy.drop_connection(addr);
        }
        if strategy.mark_failure(addr, window) {
            tracing::warn!(node = %addr, "marking broker node unhealthy");
        }
    }

    #[cfg(test)]
    pub(crate) fn with_strategy(config: ClientConfig, strategy: BalanceStrategy) -> Self {
        Self {
            config,
            strategy: Mutex::new(strategy),
        }
    }

    #[cfg(test)]
    pub(crate) async fn failure_count(&self, addr: &HostAndPort) -> u32 {
        self.strategy.lock().await.failure_count(addr)
    }
}
