// Node selection for publishes: health-aware round robin with a
// single-node fast path.
use std::time::{Duration, Instant};

use crate::conn::PubConnection;
use crate::error::{Error, Result};
use crate::host::HostAndPort;

/// Publisher-side record of one broker node.
pub(crate) struct NsqdInstance {
    addr: HostAndPort,
    connection: Option<PubConnection>,
    last_failure: Option<Instant>,
    failures: u32,
}

impl NsqdInstance {
    fn new(addr: HostAndPort) -> Self {
        Self {
            addr,
            connection: None,
            last_failure: None,
            failures: 0,
        }
    }

    fn healthy(&self, failure_backoff: Duration) -> bool {
        self.last_failure
            .map_or(true, |at| at.elapsed() >= failure_backoff)
    }
}

pub(crate) enum BalanceStrategy {
    SingleNode {
        node: NsqdInstance,
    },
    RoundRobin {
        nodes: Vec<NsqdInstance>,
        next: usize,
    },
}

impl BalanceStrategy {
    pub(crate) fn new(addrs: Vec<HostAndPort>) -> Self {
        let mut nodes: Vec<NsqdInstance> = addrs.into_iter().map(NsqdInstance::new).collect();
        if nodes.len() == 1 {
            Self::SingleNode {
                node: nodes.pop().expect("one node"),
            }
        } else {
            Self::RoundRobin { nodes, next: 0 }
        }
    }

    fn nodes(&self) -> &[NsqdInstance] {
        match self {
            Self::SingleNode { node } => std::slice::from_ref(node),
            Self::RoundRobin { nodes, .. } => nodes,
        }
    }

    fn nodes_mut(&mut self) -> &mut [NsqdInstance] {
        match self {
            Self::SingleNode { node } => std::slice::from_mut(node),
            Self::RoundRobin { nodes, .. } => nodes,
        }
    }

    /// Pick a node for the next publish. `Ok(None)` means every candidate
    /// is excluded (there is no *different* node to retry on);
    /// `NoNodesAvailable` means nothing is configured at all.
    ///
    /// Selection prefers healthy nodes in ring order. When every node is
    /// inside its failure backoff, the least-recently-failed one is
    /// returned anyway; the publish attempt itself re-marks failure.
    pub(crate) fn pick(
        &mut self,
        exclude: Option<&HostAndPort>,
        failure_backoff: Duration,
    ) -> Result<Option<HostAndPort>> {
        if self.nodes().is_empty() {
            return Err(Error::NoNodesAvailable);
        }
        match self {
            Self::SingleNode { node } => {
                if exclude == Some(&node.addr) {
                    Ok(None)
                } else {
                    Ok(Some(node.addr.clone()))
                }
            }
            Self::RoundRobin { nodes, next } => {
                let len = nodes.len();
                for offset in 0..len {
                    let index = (*next + offset) % len;
                    let node = &nodes[index];
                    if exclude == Some(&node.addr) {
                        continue;
                    }
                    if node.healthy(failure_backoff) {
                        *next = (index + 1) % len;
                        return Ok(Some(node.addr.clone()));
                    }
                }
                // All candidates are unhealthy; fall back to the one whose
                // failure is oldest.
                let fallback = nodes
                    .iter()
                    .filter(|node| exclude != Some(&node.addr))
                    .min_by_key(|node| node.last_failure)
                    .map(|node| node.addr.clone());
                if let Some(addr) = &fallback {
                    tracing::warn!(
                        node = %addr,
                        "all broker nodes unhealthy, using least-recently-failed"
                    );
                }
                Ok(fallback)
            }
        }
    }

    pub(crate) fn existing_connection(&self, addr: &HostAndPort) -> Option<PubConnection> {
        self.nodes()
            .iter()
            .find(|node| &node.addr == addr)
            .and_then(|node| node.connection.clone())
    }

    pub(crate) fn install_connection(&mut self, addr: &HostAndPort, connection: PubConnection) {
        if let Some(node) = self.nodes_mut().iter_mut().find(|node| &node.addr == addr) {
            node.connection = Some(connection);
        }
    }

    /// Record a failure on `addr`. Marks within `window` of a previous
    /// one collapse; returns whether this one was applied.
    pub(crate) fn mark_failure(&mut self, addr: &HostAndPort, window: Duration) -> bool {
        let Some(node) = self.nodes_mut().iter_mut().find(|node| &node.addr == addr) else {
            return false;
        };
        if node.last_failure.is_some_and(|at| at.elapsed() < window) {
            return false;
        }
        node.last_failure = Some(Instant::now());
        node.failures += 1;
        true
    }

    /// Discard the node's connection so the next selection reconnects.
    pub(crate) fn drop_connection(&mut self, addr: &HostAndPort) {
        let Some(node) = self.nodes_mut().iter_mut().find(|node| &node.addr == addr) else {
            return;
        };
        if let Some(connection) = node.connection.take() {
            tokio::spawn(async move { connection.close().await });
        }
    }

    pub(crate) async fn close_all(&mut self) {
        for node in self.nodes_mut() {
            if let Some(connection) = node.connection.take() {
                connection.close().await;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn failure_count(&self, addr: &HostAndPort) -> u32 {
        self.nodes()
            .iter()
            .find(|node| &node.addr == addr)
            .map_or(0, |node| node.failures)
    }

    #[cfg(test)]
    pub(crate) fn with_connections(entries: Vec<(HostAndPort, PubConnection)>) -> Self {
        let mut strategy = Self::new(entries.iter().map(|(addr, _)| addr.clone()).collect());
        for (addr, connection) in entries {
            strategy.install_connection(&addr, connection);
        }
        strategy
    }

    #[cfg(test)]
    pub(crate) fn set_last_failure(&mut self, addr: &HostAndPort, at: Instant) {
        if let Some(node) = self.nodes_mut().iter_mut().find(|node| &node.addr == addr) {
            node.last_failure = Some(at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> HostAndPort {
        HostAndPort::new("127.0.0.1", port)
    }

    fn backoff() -> Duration {
        Duration::from_secs(10)
    }

    #[test]
    fn empty_node_set_is_an_error() {
        let mut strategy = BalanceStrategy::new(Vec::new());
        let err = strategy.pick(None, backoff()).expect_err("no nodes");
        assert!(matches!(err, Error::NoNodesAvailable));
    }

    #[test]
    fn single_node_has_no_different_node_to_retry_on() {
        let mut strategy = BalanceStrategy::new(vec![addr(1)]);
        assert_eq!(strategy.pick(None, backoff()).expect("pick"), Some(addr(1)));
        assert_eq!(strategy.pick(Some(&addr(1)), backoff()).expect("pick"), None);
    }

    #[test]
    fn round_robin_cycles_healthy_nodes() {
        let mut strategy = BalanceStrategy::new(vec![addr(1), addr(2), addr(3)]);
        let picks: Vec<_> = (0..4)
            .map(|_| strategy.pick(None, backoff()).expect("pick").expect("node"))
            .collect();
        assert_eq!(picks, vec![addr(1), addr(2), addr(3), addr(1)]);
    }

    #[test]
    fn recently_failed_nodes_are_skipped() {
        let mut strategy = BalanceStrategy::new(vec![addr(1), addr(2)]);
        assert!(strategy.mark_failure(&addr(1), Duration::from_secs(5)));
        for _ in 0..3 {
            assert_eq!(
                strategy.pick(None, backoff()).expect("pick"),
                Some(addr(2))
            );
        }
    }

    #[test]
    fn all_unhealthy_returns_least_recently_failed() {
        let mut strategy = BalanceStrategy::new(vec![addr(1), addr(2)]);
        let now = Instant::now();
        strategy.set_last_failure(&addr(1), now - Duration::from_secs(8));
        strategy.set_last_failure(&addr(2), now - Duration::from_secs(2));
        assert_eq!(strategy.pick(None, backoff()).expect("pick"), Some(addr(1)));
    }

    #[test]
    fn exclusion_applies_to_the_unhealthy_fallback_too() {
        let mut strategy = BalanceStrategy::new(vec![addr(1), addr(2)]);
        let now = Instant::now();
        strategy.set_last_failure(&addr(1), now - Duration::from_secs(8));
        strategy.set_last_failure(&addr(2), now - Duration::from_secs(2));
        assert_eq!(
            strategy.pick(Some(&addr(1)), backoff()).expect("pick"),
            Some(addr(2))
        );
    }

    #[tokio::test]
    async fn repeated_marks_inside_the_window_collapse() {
        let mut strategy = BalanceStrategy::new(vec![addr(1), addr(2)]);
        let window = Duration::from_secs(5);
        assert!(strategy.mark_failure(&addr(1), window));
        assert!(!strategy.mark_failure(&addr(1), window));
        assert_eq!(strategy.failure_count(&addr(1)), 1);
    }
}
