use futures_util::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout};
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use super::backoff::ExponentialBackoff;
use super::link::ConnectionLink;
use crate::config::ConnectionConfig;
use crate::domain::{Authorization, ConnectionState};
use crate::error::{DerivError, Result};
use crate::protocol::Request;
use crate::session::RequestCorrelator;
use crate::transport::{Transport, TransportEvent};

/// Bounded wait for a clean close
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Drives the connect / authorize / keep-alive / reconnect state machine.
///
/// Owns the transport. Every opened link gets a dispatch task that feeds
/// inbound frames to the correlator and a keep-alive task; both retire
/// once their link generation is no longer current.
pub struct ConnectionManager {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    link: Arc<ConnectionLink>,
    correlator: Arc<RequestCorrelator>,
    token: Mutex<Option<Zeroizing<String>>>,
    connect_lock: tokio::sync::Mutex<()>,
    stay_connected: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        correlator: Arc<RequestCorrelator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            transport,
            link: Arc::clone(correlator.link()),
            correlator,
            token: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            stay_connected: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn link(&self) -> &Arc<ConnectionLink> {
        &self.link
    }

    /// Open the transport.
    ///
    /// Calling while a link is already open (or being opened by another
    /// caller) returns without opening a second one.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.link.state().is_open() {
            debug!(state = %self.link.state(), "Already connected");
            return Ok(());
        }

        self.stay_connected.store(true, Ordering::SeqCst);
        self.open_link().await
    }

    async fn open_link(self: &Arc<Self>) -> Result<()> {
        let url = self
            .config
            .endpoint()
            .map_err(|e| DerivError::Connection(format!("invalid endpoint: {e}")))?;

        self.link.set_state(ConnectionState::Connecting);

        let opened = match timeout(self.config.connect_timeout(), self.transport.open(&url)).await
        {
            Ok(Ok(opened)) => opened,
            Ok(Err(e)) => {
                self.link.set_state(ConnectionState::Disconnected);
                return Err(match e {
                    DerivError::Connection(_) => e,
                    other => DerivError::Connection(other.to_string()),
                });
            }
            Err(_) => {
                self.link.set_state(ConnectionState::Disconnected);
                return Err(DerivError::Connection(format!(
                    "connect timed out after {:?}",
                    self.config.connect_timeout()
                )));
            }
        };

        let generation = self.link.attach(opened.sink);
        self.link.set_state(ConnectionState::Connected);

        tokio::spawn(Arc::clone(self).run_dispatch(opened.events, generation));
        tokio::spawn(Arc::clone(self).run_keepalive(generation));
        Ok(())
    }

    /// Authorize the open link; on success the connection is `Ready`.
    ///
    /// A rejected token fails with `Auth` and drops the link.
    pub async fn authenticate(self: &Arc<Self>, token: &str) -> Result<Authorization> {
        let state = self.link.state();
        if !matches!(
            state,
            ConnectionState::Connected | ConnectionState::Authenticating
        ) {
            return Err(match state {
                ConnectionState::Disconnected | ConnectionState::Connecting => {
                    DerivError::NotReady { state }
                }
                _ => DerivError::InvalidStateTransition {
                    from: state.to_string(),
                    to: ConnectionState::Authenticating.to_string(),
                },
            });
        }

        let generation = self.link.generation();
        self.link.set_state(ConnectionState::Authenticating);

        let outcome = self
            .correlator
            .request(Request::authorize(token))
            .await
            .and_then(|response| response.parse::<Authorization>("authorize"));

        match outcome {
            Ok(authorization) => {
                *self.token.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(Zeroizing::new(token.to_string()));
                self.link.set_state(ConnectionState::Ready);
                info!(loginid = %authorization.loginid, currency = %authorization.currency, "Authorized");
                Ok(authorization)
            }
            Err(DerivError::Server { code, message }) => {
                warn!(code = %code, "Authorization rejected");
                self.stay_connected.store(false, Ordering::SeqCst);
                self.drop_link(generation, "authorization rejected").await;
                Err(DerivError::Auth { code, message })
            }
            Err(e) => {
                warn!(error = %e, "Authorization failed");
                self.drop_link(generation, "authorization failed").await;
                Err(e)
            }
        }
    }

    /// Stop reconnecting, close the link and settle in `Disconnected`
    pub async fn shutdown(&self) -> Result<()> {
        self.stay_connected.store(false, Ordering::SeqCst);
        let state = self.link.state();
        if state == ConnectionState::Disconnected {
            return Ok(());
        }

        info!("Closing connection");
        if state.can_transition_to(ConnectionState::Closing) {
            self.link.set_state(ConnectionState::Closing);
        }
        if !self.drop_link(self.link.generation(), "shutdown").await {
            self.link.set_state(ConnectionState::Disconnected);
        }
        Ok(())
    }

    /// Tear down `generation` if still current: close the sink, fail
    /// pending requests and mark subscriptions stale.
    async fn drop_link(&self, generation: u64, reason: &str) -> bool {
        let Some(sink) = self.link.detach(generation) else {
            return false;
        };

        match timeout(CLOSE_TIMEOUT, sink.close()).await {
            Ok(Err(e)) => debug!(error = %e, "Error closing link"),
            Err(_) => debug!("Timed out closing link"),
            Ok(Ok(())) => {}
        }

        self.link.set_state(ConnectionState::Disconnected);
        self.correlator.fail_pending();
        self.correlator.registry().mark_all_stale();
        debug!(generation, reason, "Link dropped");
        true
    }

    /// Handle an unexpected loss of `generation`, reconnecting if wanted
    async fn on_link_lost(self: &Arc<Self>, generation: u64, reason: String) {
        if !self.drop_link(generation, &reason).await {
            return;
        }
        warn!(reason = %reason, "Connection lost");

        if self.config.auto_reconnect && self.stay_connected.load(Ordering::SeqCst) {
            tokio::spawn(Arc::clone(self).reconnect());
        } else {
            self.stay_connected.store(false, Ordering::SeqCst);
        }
    }

    /// Boxed because the reconnect and dispatch tasks spawn each other
    fn reconnect(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut backoff = ExponentialBackoff::new(
                Duration::from_millis(self.config.reconnect_base_ms),
                Duration::from_millis(self.config.reconnect_cap_ms),
            );

            while backoff.attempt() < self.config.max_reconnect_attempts {
                let delay = backoff.next_delay();
                info!(attempt = backoff.attempt(), ?delay, "Reconnecting");
                sleep(delay).await;

                if !self.stay_connected.load(Ordering::SeqCst) {
                    debug!("Reconnect abandoned");
                    return;
                }

                let _guard = self.connect_lock.lock().await;
                if self.link.state() != ConnectionState::Disconnected {
                    debug!(state = %self.link.state(), "Connection restored elsewhere");
                    return;
                }

                match self.restore().await {
                    Ok(()) => {
                        info!(attempts = backoff.attempt(), "Reconnected");
                        return;
                    }
                    Err(e @ DerivError::Auth { .. }) => {
                        error!(error = %e, "Reconnect stopped: credentials rejected");
                        return;
                    }
                    Err(e) => warn!(attempt = backoff.attempt(), error = %e, "Reconnect attempt failed"),
                }
            }

            self.stay_connected.store(false, Ordering::SeqCst);
            error!(
                attempts = self.config.max_reconnect_attempts,
                "Reconnect budget exhausted"
            );
        })
    }

    async fn restore(self: &Arc<Self>) -> Result<()> {
        self.open_link().await?;
        let token = self
            .token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(token) = token {
            self.authenticate(token.as_str()).await?;
        }
        Ok(())
    }

    async fn run_dispatch(
        self: Arc<Self>,
        mut events: mpsc::Receiver<TransportEvent>,
        generation: u64,
    ) {
        let reason = loop {
            match events.recv().await {
                Some(TransportEvent::Frame(text)) => {
                    if self.link.generation() != generation {
                        debug!(generation, "Dropping frame from retired link");
                        continue;
                    }
                    self.correlator.dispatch(&text);
                }
                Some(TransportEvent::Closed(reason)) => {
                    break format!("closed by peer: {}", reason.unwrap_or_default());
                }
                Some(TransportEvent::Error(e)) => break format!("transport error: {e}"),
                None => break "event stream ended".to_string(),
            }
        };

        self.on_link_lost(generation, reason).await;
    }

    async fn run_keepalive(self: Arc<Self>, generation: u64) {
        let period = self.config.keepalive_period();

        loop {
            if self.link.generation() != generation {
                return;
            }

            if self.link.state() != ConnectionState::Ready {
                sleep(period).await;
                continue;
            }

            sleep_until(self.link.last_sent() + period).await;
            if self.link.generation() != generation {
                return;
            }
            if self.link.state() != ConnectionState::Ready || self.link.idle_for() < period {
                continue;
            }

            debug!("Sending heartbeat");
            match self.correlator.issue(Request::ping()).await {
                Ok(handle) => {
                    tokio::spawn(async move {
                        if let Err(e) = handle.wait().await {
                            debug!(error = %e, "Heartbeat not acknowledged");
                        }
                    });
                }
                Err(DerivError::NotReady { .. }) => continue,
                Err(e) => {
                    self.on_link_lost(generation, format!("heartbeat failed: {e}"))
                        .await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::transport::{MockTransport, ScriptedBroker};

    fn manager_with(transport: MockTransport, config: ConnectionConfig) -> Arc<ConnectionManager> {
        let link = Arc::new(ConnectionLink::new());
        let correlator = Arc::new(RequestCorrelator::new(link, &SessionConfig::default()));
        ConnectionManager::new(config, Arc::new(transport), correlator)
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let transport = ScriptedBroker::new("tok").transport();
        let manager = manager_with(transport.clone(), ConnectionConfig::new("1089"));

        manager.connect().await.unwrap();
        manager.connect().await.unwrap();
        assert_eq!(transport.open_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_authenticate_reaches_ready() {
        let transport = ScriptedBroker::new("tok").transport();
        let manager = manager_with(transport.clone(), ConnectionConfig::new("1089"));

        manager.connect().await.unwrap();
        let auth = manager.authenticate("tok").await.unwrap();
        assert_eq!(auth.loginid, "CR900000");
        assert_eq!(manager.state(), ConnectionState::Ready);
    }

    #[tokio::test]
    async fn test_rejected_token_disconnects() {
        let transport = ScriptedBroker::new("tok").transport();
        let manager = manager_with(transport.clone(), ConnectionConfig::new("1089"));

        manager.connect().await.unwrap();
        let result = manager.authenticate("wrong").await;
        match result {
            Err(DerivError::Auth { code, .. }) => assert_eq!(code, "InvalidToken"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_failure_is_connection_error() {
        let transport = MockTransport::new();
        transport.fail_next_opens(1);
        let manager = manager_with(transport, ConnectionConfig::new("1089"));

        assert!(matches!(
            manager.connect().await,
            Err(DerivError::Connection(_))
        ));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_authenticate_requires_open_link() {
        let manager = manager_with(MockTransport::new(), ConnectionConfig::new("1089"));
        assert!(matches!(
            manager.authenticate("tok").await,
            Err(DerivError::NotReady { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_only_when_idle() {
        let transport = ScriptedBroker::new("tok").transport();
        let manager = manager_with(transport.clone(), ConnectionConfig::new("1089"));
        manager.connect().await.unwrap();
        manager.authenticate("tok").await.unwrap();

        sleep(Duration::from_secs(20)).await;
        assert!(transport.sent_op("ping").is_empty());

        sleep(Duration::from_secs(15)).await;
        assert_eq!(transport.sent_op("ping").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_drop() {
        let transport = ScriptedBroker::new("tok").transport();
        let manager = manager_with(transport.clone(), ConnectionConfig::new("1089"));
        manager.connect().await.unwrap();
        manager.authenticate("tok").await.unwrap();

        transport.drop_link("server restart");
        while transport.open_count() < 2 {
            sleep(Duration::from_millis(100)).await;
        }

        let state = manager.link().wait_for(|s| s == ConnectionState::Ready).await;
        assert_eq!(state, ConnectionState::Ready);
        assert_eq!(transport.open_count(), 2);
        assert_eq!(transport.sent_op("authorize").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reconnect_when_disabled() {
        let transport = ScriptedBroker::new("tok").transport();
        let mut config = ConnectionConfig::new("1089");
        config.auto_reconnect = false;
        let manager = manager_with(transport.clone(), config);
        manager.connect().await.unwrap();
        manager.authenticate("tok").await.unwrap();

        transport.drop_link("gone");
        manager
            .link()
            .wait_for(|s| s == ConnectionState::Disconnected)
            .await;
        sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.open_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_budget() {
        let transport = ScriptedBroker::new("tok").transport();
        let mut config = ConnectionConfig::new("1089");
        config.max_reconnect_attempts = 3;
        let manager = manager_with(transport.clone(), config);
        manager.connect().await.unwrap();
        manager.authenticate("tok").await.unwrap();

        transport.fail_next_opens(4);
        transport.drop_link("server gone");
        while transport.open_count() < 4 {
            sleep(Duration::from_millis(100)).await;
        }

        sleep(Duration::from_secs(600)).await;
        assert_eq!(transport.open_count(), 4);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.stay_connected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_is_clean() {
        let transport = ScriptedBroker::new("tok").transport();
        let manager = manager_with(transport.clone(), ConnectionConfig::new("1089"));
        manager.connect().await.unwrap();
        manager.authenticate("tok").await.unwrap();

        manager.shutdown().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        manager.shutdown().await.unwrap();
    }
}
