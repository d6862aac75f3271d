use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::types::{Action, Entity, Severity, ToastId};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Toast {
    pub id: ToastId,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub entity: Option<Entity>,
    pub action: Option<Action>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewToast {
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub entity: Option<Entity>,
    pub action: Option<Action>,
}

impl NewToast {
    pub fn new(severity: Severity, title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.into(),
            message: message.into(),
            entity: None,
            action: None,
        }
    }

    pub fn success(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Success, title, message)
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, title, message)
    }
}

/// Active, self-dismissing notices. Nothing here is persisted.
#[derive(Clone)]
pub struct ToastQueue {
    ttl: Duration,
    active: Arc<watch::Sender<Vec<Toast>>>,
    timers: Arc<DashMap<ToastId, JoinHandle<()>>>,
}

impl ToastQueue {
    pub fn new(ttl: Duration) -> Self {
        let (active, _) = watch::channel(Vec::new());
        Self {
            ttl,
            active: Arc::new(active),
            timers: Arc::new(DashMap::new()),
        }
    }

    pub fn add(&self, toast: NewToast) -> ToastId {
        let id = Uuid::now_v7();
        let entry = Toast {
            id,
            severity: toast.severity,
            title: toast.title,
            message: toast.message,
            entity: toast.entity,
            action: toast.action,
            created_at: Utc::now(),
        };

        self.active.send_modify(|list| list.push(entry));

        match Handle::try_current() {
            Ok(handle) => {
                let queue = self.clone();
                let ttl = self.ttl;
                let timer = handle.spawn(async move {
                    tokio::time::sleep(ttl).await;
                    queue.timers.remove(&id);
                    queue.remove_entry(id);
                    debug!(%id, "toast expired");
                });
                self.timers.insert(id, timer);
            }
            Err(_) => warn!(%id, "no async runtime, toast will not auto-expire"),
        }

        id
    }

    /// Dismisses a toast before its expiry. Unknown ids are ignored.
    pub fn remove(&self, id: ToastId) -> bool {
        if let Some((_, timer)) = self.timers.remove(&id) {
            timer.abort();
        }
        self.remove_entry(id)
    }

    pub fn clear(&self) {
        self.timers.retain(|_, timer| {
            timer.abort();
            false
        });
        self.active.send_if_modified(|list| {
            let changed = !list.is_empty();
            list.clear();
            changed
        });
    }

    pub fn active(&self) -> Vec<Toast> {
        self.active.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.active.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.borrow().is_empty()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<Toast>> {
        self.active.subscribe()
    }

    fn remove_entry(&self, id: ToastId) -> bool {
        self.active.send_if_modified(|list| {
            let before = list.len();
            list.retain(|t| t.id != id);
            list.len() != before
        })
    }
}
