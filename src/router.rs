use tracing::{debug, warn};

use crate::history::{HistoryEntry, HistoryStore};
use crate::subscriptions::Subscriptions;
use crate::toast::{NewToast, ToastQueue};
use crate::types::{Action, ChangeEvent, Entity, ServerMsg, Severity};

pub const CHANGE_TITLE: &str = "Data Updated";

/// Turns inbound frames into change events and feeds the toast queue, the
/// history store and the subscription registry.
#[derive(Clone)]
pub struct MessageRouter {
    toasts: ToastQueue,
    history: HistoryStore,
    subscriptions: Subscriptions,
}

impl MessageRouter {
    pub fn new(toasts: ToastQueue, history: HistoryStore, subscriptions: Subscriptions) -> Self {
        Self {
            toasts,
            history,
            subscriptions,
        }
    }

    /// Returns true when the frame carried a change event.
    pub fn handle_frame(&self, text: &str) -> bool {
        let msg: ServerMsg = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                return false;
            }
        };

        match msg {
            ServerMsg::DataChange(event) => {
                self.route(&event);
                true
            }
            ServerMsg::Other => {
                debug!("ignoring non data_change frame");
                false
            }
        }
    }

    pub fn route(&self, event: &ChangeEvent) {
        let severity = severity_for(&event.action);
        let message = describe(event);

        self.toasts.add(NewToast {
            severity,
            title: CHANGE_TITLE.to_string(),
            message: message.clone(),
            entity: Some(event.entity.clone()),
            action: Some(event.action.clone()),
        });

        self.history
            .append(HistoryEntry::from_event(event, severity, CHANGE_TITLE, message));

        // Panicking subscribers are contained inside dispatch.
        let invoked = self.subscriptions.dispatch(&event.entity, event);

        debug!(
            entity = %event.entity,
            action = %event.action,
            invoked,
            "change event routed"
        );
    }
}

pub fn severity_for(action: &Action) -> Severity {
    match action {
        Action::Delete => Severity::Warning,
        _ => Severity::Info,
    }
}

pub fn action_label(action: &Action) -> &str {
    match action {
        Action::Create => "created",
        Action::Update => "modified",
        Action::Delete => "deleted",
        Action::Other(raw) => raw,
    }
}

pub fn entity_label(entity: &Entity) -> &str {
    match entity {
        Entity::LeaveRecords => "leave record",
        Entity::Personnel => "personnel record",
        Entity::UserAccounts => "user account",
        Entity::LeaveTypes => "leave type",
        Entity::Holidays => "holiday",
        Entity::Audit => "audit log",
        Entity::Other(raw) => raw,
    }
}

/// "admin1 deleted leave record"
pub fn describe(event: &ChangeEvent) -> String {
    format!(
        "{} {} {}",
        event.actor_name,
        action_label(&event.action),
        entity_label(&event.entity)
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::history::MemoryBackend;

    fn router() -> (MessageRouter, ToastQueue, HistoryStore, Subscriptions) {
        let toasts = ToastQueue::new(Duration::from_secs(5));
        let history = HistoryStore::open(Arc::new(MemoryBackend::new()), 50);
        let subs = Subscriptions::new();
        let router = MessageRouter::new(toasts.clone(), history.clone(), subs.clone());
        (router, toasts, history, subs)
    }

    #[test]
    fn labels_fall_back_to_raw_values() {
        assert_eq!(action_label(&Action::Update), "modified");
        assert_eq!(action_label(&Action::Other("archive".into())), "archive");
        assert_eq!(entity_label(&Entity::LeaveRecords), "leave record");
        assert_eq!(entity_label(&Entity::Other("payroll".into())), "payroll");
    }

    #[test]
    fn only_delete_is_a_warning() {
        assert_eq!(severity_for(&Action::Delete), Severity::Warning);
        assert_eq!(severity_for(&Action::Create), Severity::Info);
        assert_eq!(severity_for(&Action::Other("archive".into())), Severity::Info);
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frame_has_no_effects() {
        crate::init_test_tracing();
        let (router, toasts, history, subs) = router();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _sub = subs.subscribe(Entity::Holidays, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!router.handle_frame("not json at all"));
        assert!(!router.handle_frame(r#"{"type":"heartbeat_ack"}"#));
        assert!(router.handle_frame(
            r#"{"type":"data_change","entity":"holidays","action":"create","username":"hr","details":null}"#
        ));

        assert_eq!(toasts.len(), 1);
        assert_eq!(history.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_subscriber_does_not_block_toast_or_history() {
        let (router, toasts, history, subs) = router();
        let _boom = subs.subscribe(Entity::Personnel, |_| panic!("render failed"));

        router.handle_frame(
            r#"{"type":"data_change","entity":"personnel","action":"update","username":"op","details":{}}"#,
        );

        assert_eq!(toasts.active()[0].message, "op modified personnel record");
        assert_eq!(history.entries()[0].severity, Severity::Info);
    }

    #[tokio::test(start_paused = true)]
    async fn string_entity_id_and_null_username_still_route() {
        let (router, toasts, history, subs) = router();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _sub = subs.subscribe(Entity::Personnel, move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(router.handle_frame(
            r#"{"type":"data_change","entity":"personnel","action":"update","username":"hr","entity_id":"NIP-1987","details":{}}"#
        ));
        assert!(router.handle_frame(
            r#"{"type":"data_change","entity":"personnel","action":"delete","username":null,"entity_id":7}"#
        ));

        assert_eq!(toasts.len(), 2);
        assert_eq!(history.len(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(history.entries()[0].actor_name, "");
        assert_eq!(history.entries()[1].actor_name, "hr");
    }
}
