use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::HubConfig;
use crate::credentials::CredentialSource;
use crate::router::MessageRouter;
use crate::transport::{Connection, Transport};
use crate::types::ClientMsg;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    ClosedByPeer,
    Error,
    HeartbeatFailed,
}

/// `min(base * 2^attempts, max)`
pub fn backoff_delay(base: Duration, max: Duration, attempts: u32) -> Duration {
    let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

struct LinkState {
    attempts: u32,
    // Bumped on every connect/disconnect so a superseded session loop stops
    // touching shared state.
    generation: u64,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    config: Arc<HubConfig>,
    url: Url,
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    router: MessageRouter,
    link: Mutex<LinkState>,
    status: watch::Sender<ConnectionStatus>,
}

/// Owns the single push connection and its reconnect loop.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        config: Arc<HubConfig>,
        url: Url,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
        router: MessageRouter,
    ) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            shared: Arc::new(Shared {
                config,
                url,
                transport,
                credentials,
                router,
                link: Mutex::new(LinkState {
                    attempts: 0,
                    generation: 0,
                    cancel: None,
                    task: None,
                }),
                status,
            }),
        }
    }

    pub fn connect(&self) {
        let mut link = self.shared.link.lock();

        if link.task.is_some() {
            debug!("connection already live");
            return;
        }

        if !self.shared.credentials.is_present() {
            info!("no session credential, skipping connection");
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            warn!("no tokio runtime, skipping connection");
            return;
        };

        link.attempts = 0;
        link.generation += 1;
        let generation = link.generation;
        let cancel = CancellationToken::new();
        link.cancel = Some(cancel.clone());

        let this = self.clone();
        link.task = Some(runtime.spawn(async move {
            this.run(generation, cancel).await;
        }));
    }

    pub fn disconnect(&self) {
        let mut link = self.shared.link.lock();

        if let Some(cancel) = link.cancel.take() {
            cancel.cancel();
        }
        // The session task finishes its close handshake on its own.
        link.task = None;
        link.generation += 1;
        link.attempts = self.shared.config.max_reconnect_attempts;
        drop(link);

        self.shared.status.send_replace(ConnectionStatus::Disconnected);
        info!("disconnected on request");
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.link.lock().attempts
    }

    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    async fn run(self, generation: u64, cancel: CancellationToken) {
        let config = self.shared.config.clone();

        loop {
            self.publish(generation, ConnectionStatus::Connecting);
            info!(url = %self.shared.url, "connecting to push endpoint");

            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.shared.transport.open(&self.shared.url) => res,
            };

            match opened {
                Ok(conn) => {
                    if !self.with_current(generation, |link| link.attempts = 0) {
                        break;
                    }
                    self.publish(generation, ConnectionStatus::Connected);
                    info!("push connection established");

                    let end = self.session(conn, &cancel).await;
                    info!(reason = ?end, "push connection closed");
                }
                Err(e) => {
                    warn!(error = %e, "push connection failed");
                }
            }

            self.publish(generation, ConnectionStatus::Disconnected);

            if cancel.is_cancelled() {
                break;
            }

            let attempts = self.shared.link.lock().attempts;
            if attempts >= config.max_reconnect_attempts {
                warn!(attempts, "reconnect attempts exhausted");
                break;
            }
            if !self.shared.credentials.is_present() {
                info!("session credential gone, not reconnecting");
                break;
            }

            let delay = backoff_delay(
                config.reconnect_base_delay,
                config.reconnect_max_delay,
                attempts,
            );
            info!(
                delay_ms = delay.as_millis() as u64,
                attempt = attempts + 1,
                "scheduling reconnect"
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            if !self.with_current(generation, |link| {
                link.attempts = link.attempts.saturating_add(1)
            }) {
                break;
            }
        }

        self.with_current(generation, |link| {
            link.task = None;
            link.cancel = None;
        });
        debug!(generation, "session loop finished");
    }

    async fn session(&self, conn: Connection, cancel: &CancellationToken) -> SessionEnd {
        let Connection {
            mut sink,
            mut stream,
        } = conn;

        let mut period = self.shared.config.heartbeat_interval;
        if period.is_zero() {
            // interval_at panics on a zero period.
            period = HubConfig::default().heartbeat_interval;
            warn!(?period, "zero heartbeat interval, using default");
        }
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
                        Ok(Err(e)) => debug!(error = %e, "close handshake failed"),
                        Err(_) => debug!("close handshake timed out"),
                        Ok(Ok(())) => {}
                    }
                    return SessionEnd::Cancelled;
                }
                _ = heartbeat.tick() => {
                    let text = match serde_json::to_string(&ClientMsg::Heartbeat) {
                        Ok(t) => t,
                        Err(e) => {
                            error!("failed to serialize heartbeat: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(text).await {
                        warn!(error = %e, "heartbeat send failed");
                        return SessionEnd::HeartbeatFailed;
                    }
                    debug!("heartbeat sent");
                }
                frame = stream.next() => match frame {
                    Some(Ok(text)) => {
                        self.shared.router.handle_frame(&text);
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "push connection error");
                        return SessionEnd::Error;
                    }
                    None => return SessionEnd::ClosedByPeer,
                },
            }
        }
    }

    /// Applies `f` only while `generation` is still the live session.
    fn with_current(&self, generation: u64, f: impl FnOnce(&mut LinkState)) -> bool {
        let mut link = self.shared.link.lock();
        if link.generation != generation {
            return false;
        }
        f(&mut link);
        true
    }

    fn publish(&self, generation: u64, status: ConnectionStatus) {
        if self.with_current(generation, |_| {}) {
            self.shared.status.send_replace(status);
        }
    }
}
