use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod config;
pub mod connection;
pub mod credentials;
pub mod history;
pub mod router;
pub mod subscriptions;
pub mod toast;
pub mod transport;
pub mod types;

pub use config::{ConfigError, HubConfig};
pub use connection::{ConnectionManager, ConnectionStatus};
pub use credentials::{CredentialSource, SessionCredential};
pub use history::{FileBackend, HistoryBackend, HistoryEntry, HistoryStore, MemoryBackend};
pub use router::MessageRouter;
pub use subscriptions::{Subscription, Subscriptions};
pub use toast::{NewToast, Toast, ToastQueue};
pub use transport::{Transport, WsTransport};
pub use types::{Action, ChangeEvent, Entity, Severity};

/// Application-wide notification service: one push connection, one history,
/// one toast queue and one subscription registry, injected into the UI layer.
pub struct NotificationHub {
    config: Arc<HubConfig>,
    credentials: Arc<dyn CredentialSource>,
    toasts: ToastQueue,
    history: HistoryStore,
    subscriptions: Subscriptions,
    connection: ConnectionManager,
    startup: Mutex<Option<CancellationToken>>,
}

impl NotificationHub {
    pub fn new(
        config: HubConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
        backend: Arc<dyn HistoryBackend>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let url = config.push_url()?;
        let config = Arc::new(config);

        let toasts = ToastQueue::new(config.toast_ttl);
        let history = HistoryStore::open(backend, config.history_cap);
        let subscriptions = Subscriptions::new();
        let router = MessageRouter::new(toasts.clone(), history.clone(), subscriptions.clone());
        let connection = ConnectionManager::new(
            config.clone(),
            url,
            transport,
            credentials.clone(),
            router,
        );

        Ok(Arc::new(Self {
            config,
            credentials,
            toasts,
            history,
            subscriptions,
            connection,
            startup: Mutex::new(None),
        }))
    }

    /// Production wiring: websocket transport and file-backed history.
    pub fn from_config(
        config: HubConfig,
        credentials: Arc<dyn CredentialSource>,
    ) -> anyhow::Result<Arc<Self>> {
        let backend = Arc::new(FileBackend::new(config.history_path.clone()));
        Self::new(config, Arc::new(WsTransport), credentials, backend)
            .context("failed to build notification hub")
    }

    /// Schedules the first connection shortly after a session is detected, so
    /// the server has time to come up.
    pub fn start(&self) {
        if !self.credentials.is_present() {
            debug!("no session credential, hub idle until connect");
            return;
        }

        let Ok(runtime) = Handle::try_current() else {
            warn!("no tokio runtime, hub not started");
            return;
        };

        let token = CancellationToken::new();
        if let Some(previous) = self.startup.lock().replace(token.clone()) {
            previous.cancel();
        }

        let connection = self.connection.clone();
        let delay = self.config.initial_connect_delay;
        runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => connection.connect(),
            }
        });
    }

    pub fn connect(&self) {
        self.connection.connect();
    }

    pub fn disconnect(&self) {
        self.cancel_startup();
        self.connection.disconnect();
    }

    /// Tears down live state. The persisted history is left intact.
    pub fn dispose(&self) {
        self.disconnect();
        self.toasts.clear();
        info!("notification hub disposed");
    }

    pub fn subscribe<F>(&self, entity: impl Into<Entity>, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.subscriptions.subscribe(entity, callback)
    }

    pub fn toasts(&self) -> &ToastQueue {
        &self.toasts
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn subscriptions(&self) -> &Subscriptions {
        &self.subscriptions
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    fn cancel_startup(&self) {
        if let Some(token) = self.startup.lock().take() {
            token.cancel();
        }
    }
}

impl Drop for NotificationHub {
    fn drop(&mut self) {
        self.cancel_startup();
        self.connection.disconnect();
    }
}

#[cfg(test)]
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::transport::scripted::ScriptedTransport;

    const DELETE_FRAME: &str = r#"{"type":"data_change","entity":"leave_records","action":"delete","username":"admin1","details":{"id":42}}"#;

    fn hub(transport: Arc<ScriptedTransport>) -> (Arc<NotificationHub>, SessionCredential) {
        let credential = SessionCredential::with_token("session-token");
        let hub = NotificationHub::new(
            HubConfig::default(),
            transport,
            Arc::new(credential.clone()),
            Arc::new(MemoryBackend::new()),
        )
        .unwrap();
        (hub, credential)
    }

    fn recorder(hub: &NotificationHub, entity: Entity) -> (Subscription, Arc<Mutex<Vec<ChangeEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = hub.subscribe(entity, move |event| sink.lock().push(event.clone()));
        (sub, seen)
    }

    #[tokio::test(start_paused = true)]
    async fn delete_event_flows_to_toast_history_and_subscribers() {
        init_test_tracing();
        let (transport, mut accepted) = ScriptedTransport::new(true);
        let (hub, _credential) = hub(transport.clone());
        let (_leaves, leave_events) = recorder(&hub, Entity::LeaveRecords);
        let (_audit, audit_events) = recorder(&hub, Entity::Audit);

        hub.start();
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(transport.open_count(), 0);

        let server = accepted.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(hub.is_connected());

        server.push(DELETE_FRAME);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let toasts = hub.toasts().active();
        assert_eq!(toasts.len(), 1);
        assert_eq!(toasts[0].severity, Severity::Warning);
        assert_eq!(toasts[0].title, "Data Updated");
        assert!(toasts[0].message.contains("admin1"));
        assert!(toasts[0].message.contains("leave record"));

        let history = hub.history().entries();
        assert_eq!(history.len(), 1);
        assert!(!history[0].read);
        assert_eq!(history[0].actor_name, "admin1");
        assert_eq!(history[0].details, json!({"id": 42}));
        assert_eq!(hub.history().unread_count(), 1);

        assert_eq!(leave_events.lock().len(), 1);
        assert_eq!(audit_events.lock().len(), 1);
        assert_eq!(audit_events.lock()[0].action, Action::Delete);

        // Toast expires, history stays.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(hub.toasts().is_empty());
        assert_eq!(hub.history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frame_is_isolated() {
        let (transport, mut accepted) = ScriptedTransport::new(true);
        let (hub, _credential) = hub(transport);
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let _sub = hub.subscribe("leaves", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        hub.connect();
        let server = accepted.recv().await.unwrap();
        server.push("<<garbage>>");
        server.push(DELETE_FRAME);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(hub.is_connected());
        assert_eq!(hub.toasts().len(), 1);
        assert_eq!(hub.history().len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn start_without_credential_stays_idle() {
        let (transport, _accepted) = ScriptedTransport::new(true);
        let (hub, credential) = hub(transport.clone());
        credential.clear();

        hub.start();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(transport.open_count(), 0);
        assert_eq!(hub.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn dispose_before_delayed_start_prevents_connection() {
        let (transport, _accepted) = ScriptedTransport::new(true);
        let (hub, _credential) = hub(transport.clone());

        hub.start();
        hub.toasts().add(NewToast::success("Saved", "personnel record saved"));
        hub.dispose();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(transport.open_count(), 0);
        assert!(hub.toasts().is_empty());
    }

    #[test]
    fn start_outside_runtime_is_noop() {
        let (transport, _accepted) = ScriptedTransport::new(true);
        let (hub, _credential) = hub(transport.clone());

        hub.start();
        hub.connect();

        assert_eq!(transport.open_count(), 0);
        assert_eq!(hub.status(), ConnectionStatus::Disconnected);
        assert!(hub.startup.lock().is_none());
    }

    #[test]
    fn zero_heartbeat_config_is_rejected() {
        let (transport, _accepted) = ScriptedTransport::new(true);
        let config = HubConfig {
            heartbeat_interval: Duration::ZERO,
            ..HubConfig::default()
        };
        let res = NotificationHub::new(
            config,
            transport,
            Arc::new(SessionCredential::with_token("session-token")),
            Arc::new(MemoryBackend::new()),
        );
        assert!(matches!(res, Err(ConfigError::ZeroDuration("heartbeat_interval"))));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_explicit_disconnect_requires_connect() {
        let (transport, mut accepted) = ScriptedTransport::new(true);
        let (hub, _credential) = hub(transport.clone());

        hub.connect();
        let _first = accepted.recv().await.unwrap();
        hub.disconnect();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.open_count(), 1);

        hub.connect();
        let _second = accepted.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(hub.is_connected());
        assert_eq!(hub.connection().reconnect_attempts(), 0);
    }
}
