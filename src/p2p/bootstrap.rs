//! Bootstrap coordinator
//!
//! Keeps a node connected to its bootstrap peers: one explicit connect when
//! a peer is given, then a periodic check that redials every bootstrap peer
//! while the node has fewer connections than the configured threshold.

use super::P2PError;
use crate::identity::PeerAddress;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between connectivity checks
pub const BOOTSTRAP_PERIOD: Duration = Duration::from_secs(60);

/// Bound on each connection attempt
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Lazily evaluated bootstrap peer set
pub type PeerSource = Arc<dyn Fn() -> Vec<PeerAddress> + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BootstrapError {
    #[error("Invalid bootstrap config: {0}")]
    InvalidConfig(String),

    #[error("Bootstrap is already running for this node")]
    AlreadyRunning,
}

/// Something the coordinator can dial through
#[async_trait]
pub trait PeerConnector: Clone + Send + Sync + 'static {
    fn connected_peer_count(&self) -> usize;

    async fn connect(&self, peer: &PeerAddress, timeout: Duration) -> Result<(), P2PError>;
}

#[derive(Clone)]
pub struct BootstrapConfig {
    pub min_peer_threshold: usize,
    pub period: Duration,
    pub connection_timeout: Duration,
    bootstrap_peers: PeerSource,
}

impl BootstrapConfig {
    /// Config for the node that is itself the bootstrap
    pub fn seed() -> Self {
        Self {
            min_peer_threshold: 0,
            period: BOOTSTRAP_PERIOD,
            connection_timeout: CONNECTION_TIMEOUT,
            bootstrap_peers: Arc::new(Vec::<PeerAddress>::new),
        }
    }

    /// Config for a node joining through a single peer
    pub fn with_peer(peer: PeerAddress) -> Self {
        Self::with_peers(vec![peer])
    }

    /// Config for a node joining through a fixed peer set
    pub fn with_peers(peers: Vec<PeerAddress>) -> Self {
        let min_peer_threshold = usize::from(!peers.is_empty());
        Self {
            min_peer_threshold,
            period: BOOTSTRAP_PERIOD,
            connection_timeout: CONNECTION_TIMEOUT,
            bootstrap_peers: Arc::new(move || peers.clone()),
        }
    }

    /// Config whose peer set is computed on every check
    pub fn with_source(min_peer_threshold: usize, source: PeerSource) -> Self {
        Self {
            min_peer_threshold,
            period: BOOTSTRAP_PERIOD,
            connection_timeout: CONNECTION_TIMEOUT,
            bootstrap_peers: source,
        }
    }

    pub fn with_timing(mut self, period: Duration, connection_timeout: Duration) -> Self {
        self.period = period;
        self.connection_timeout = connection_timeout;
        self
    }

    pub fn peers(&self) -> Vec<PeerAddress> {
        (self.bootstrap_peers)()
    }

    pub fn is_seed(&self) -> bool {
        self.min_peer_threshold == 0 && self.peers().is_empty()
    }

    /// An empty peer set goes with a zero threshold and vice versa
    pub fn validate(&self) -> Result<(), BootstrapError> {
        if self.period.is_zero() {
            return Err(BootstrapError::InvalidConfig("period must be non-zero".into()));
        }

        let peers = self.peers();
        match (peers.is_empty(), self.min_peer_threshold) {
            (true, 0) | (false, 1..) => Ok(()),
            (true, n) => Err(BootstrapError::InvalidConfig(format!(
                "threshold {} with no bootstrap peers",
                n
            ))),
            (false, 0) => Err(BootstrapError::InvalidConfig(
                "bootstrap peers given but threshold is 0".into(),
            )),
        }
    }
}

impl fmt::Debug for BootstrapConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapConfig")
            .field("min_peer_threshold", &self.min_peer_threshold)
            .field("period", &self.period)
            .field("connection_timeout", &self.connection_timeout)
            .field("bootstrap_peers", &self.peers())
            .finish()
    }
}

/// Running coordinator
#[derive(Debug)]
pub struct BootstrapHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl BootstrapHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Install `config` and start the periodic loop
///
/// When the config names bootstrap peers, they are dialed once before this
/// returns; failures are logged and left to the loop.
pub async fn start_bootstrap<C: PeerConnector>(
    connector: C,
    config: BootstrapConfig,
    cancel: CancellationToken,
) -> Result<BootstrapHandle, BootstrapError> {
    config.validate()?;

    info!(
        "Starting bootstrap (threshold {}, every {:?})",
        config.min_peer_threshold, config.period
    );

    let task = tokio::spawn(bootstrap_loop(
        connector.clone(),
        config.clone(),
        cancel.clone(),
    ));

    for peer in config.peers() {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = connector.connect(&peer, config.connection_timeout) => match result {
                Ok(()) => info!("Connected to bootstrap peer {}", peer.peer_id),
                Err(e) => warn!("Failed to connect to bootstrap peer {}: {}", peer.peer_id, e),
            },
        }
    }

    Ok(BootstrapHandle { cancel, task })
}

async fn bootstrap_loop<C: PeerConnector>(
    connector: C,
    config: BootstrapConfig,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + config.period, config.period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let connected = connector.connected_peer_count();
        if connected >= config.min_peer_threshold {
            continue;
        }

        debug!(
            "{} connected peers, below threshold {}; redialing bootstrap peers",
            connected, config.min_peer_threshold
        );

        for peer in config.peers() {
            let connector = connector.clone();
            let cancel = cancel.clone();
            let timeout = config.connection_timeout;
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    result = connector.connect(&peer, timeout) => {
                        if let Err(e) = result {
                            warn!("Bootstrap reconnect to {} failed: {}", peer.peer_id, e);
                        }
                    }
                }
            });
        }
    }

    debug!("Bootstrap loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::PeerId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct MockConnector {
        attempts: Arc<AtomicUsize>,
        connected: Arc<AtomicUsize>,
        succeed: bool,
    }

    #[async_trait]
    impl PeerConnector for MockConnector {
        fn connected_peer_count(&self) -> usize {
            self.connected.load(Ordering::SeqCst)
        }

        async fn connect(&self, peer: &PeerAddress, _timeout: Duration) -> Result<(), P2PError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                self.connected.store(1, Ordering::SeqCst);
                Ok(())
            } else {
                Err(P2PError::ConnectionFailed {
                    peer: peer.peer_id,
                    reason: "unreachable".into(),
                })
            }
        }
    }

    fn peer() -> PeerAddress {
        PeerAddress::new(
            PeerId::random(),
            vec!["/ip4/127.0.0.1/tcp/4001".parse().unwrap()],
        )
    }

    #[test]
    fn test_thresholds() {
        let seed = BootstrapConfig::seed();
        assert_eq!(seed.min_peer_threshold, 0);
        assert!(seed.peers().is_empty());
        assert!(seed.is_seed());
        assert!(seed.validate().is_ok());

        let client = BootstrapConfig::with_peer(peer());
        assert_eq!(client.min_peer_threshold, 1);
        assert_eq!(client.peers().len(), 1);
        assert!(!client.is_seed());
        assert!(client.validate().is_ok());

        assert_eq!(BootstrapConfig::with_peers(vec![]).min_peer_threshold, 0);
        assert_eq!(client.period, BOOTSTRAP_PERIOD);
        assert_eq!(client.connection_timeout, CONNECTION_TIMEOUT);
    }

    #[test]
    fn test_invalid_configs() {
        let orphan_threshold = BootstrapConfig::with_source(1, Arc::new(Vec::<PeerAddress>::new));
        assert!(orphan_threshold.validate().is_err());

        let p = peer();
        let zero_threshold = BootstrapConfig::with_source(0, Arc::new(move || vec![p.clone()]));
        assert!(zero_threshold.validate().is_err());

        let no_period =
            BootstrapConfig::seed().with_timing(Duration::ZERO, CONNECTION_TIMEOUT);
        assert!(no_period.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_connects_before_first_tick() {
        let connector = MockConnector::default();
        let cancel = CancellationToken::new();

        let handle = start_bootstrap(
            connector.clone(),
            BootstrapConfig::with_peer(peer()),
            cancel.clone(),
        )
        .await
        .unwrap();

        // Explicit attempt happened synchronously
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);

        tokio::time::sleep(BOOTSTRAP_PERIOD + Duration::from_secs(1)).await;
        assert!(connector.attempts.load(Ordering::SeqCst) >= 2);

        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_idle_when_threshold_met() {
        let connector = MockConnector {
            succeed: true,
            ..Default::default()
        };

        let handle = start_bootstrap(
            connector.clone(),
            BootstrapConfig::with_peer(peer()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        tokio::time::sleep(BOOTSTRAP_PERIOD * 3).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);

        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_seed_never_dials() {
        let connector = MockConnector::default();

        let handle = start_bootstrap(
            connector.clone(),
            BootstrapConfig::seed(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        tokio::time::sleep(BOOTSTRAP_PERIOD * 3).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);

        handle.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_loop() {
        let connector = MockConnector::default();
        let cancel = CancellationToken::new();

        let handle = start_bootstrap(
            connector.clone(),
            BootstrapConfig::with_peer(peer()),
            cancel.clone(),
        )
        .await
        .unwrap();

        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(handle.is_finished());

        tokio::time::sleep(BOOTSTRAP_PERIOD * 3).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = BootstrapConfig::with_source(2, Arc::new(Vec::<PeerAddress>::new));
        let result =
            start_bootstrap(MockConnector::default(), config, CancellationToken::new()).await;

        assert!(matches!(result, Err(BootstrapError::InvalidConfig(_))));
    }
}
