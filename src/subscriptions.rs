use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::{debug, error};
use uuid::Uuid;

use crate::types::{ChangeEvent, Entity};

pub type SubscriberId = Uuid;
pub type Callback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

type Registry = DashMap<Entity, Vec<Registration>>;

#[derive(Clone)]
struct Registration {
    id: SubscriberId,
    callback: Callback,
    // Cleared on removal so snapshots taken before the removal skip it.
    active: Arc<AtomicBool>,
}

/// Maps an entity to the callbacks interested in its changes.
///
/// Every event for a non-audit entity is also delivered to the `audit`
/// subscribers, so an audit view sees all mutations.
#[derive(Clone, Default)]
pub struct Subscriptions {
    registry: Arc<Registry>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, entity: impl Into<Entity>, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let entity = entity.into();
        let id = Uuid::now_v7();

        self.registry
            .entry(entity.clone())
            .or_default()
            .push(Registration {
                id,
                callback: Arc::new(callback),
                active: Arc::new(AtomicBool::new(true)),
            });

        debug!(%entity, subscriber = %id, "subscribed");

        Subscription {
            registry: Arc::downgrade(&self.registry),
            entity,
            id,
            detached: false,
        }
    }

    /// Removes one registration. Returns false if it was already gone.
    pub fn unsubscribe(&self, entity: &Entity, id: SubscriberId) -> bool {
        remove_registration(&self.registry, entity, id)
    }

    /// Invokes every callback for `entity` (plus `audit` callbacks for other
    /// entities) in registration order. Returns how many callbacks ran.
    pub fn dispatch(&self, entity: &Entity, event: &ChangeEvent) -> usize {
        let mut invoked = self.notify(entity, event);
        if !entity.is_audit() {
            invoked += self.notify(&Entity::Audit, event);
        }
        invoked
    }

    pub fn subscriber_count(&self, entity: &Entity) -> usize {
        self.registry.get(entity).map(|regs| regs.len()).unwrap_or(0)
    }

    fn notify(&self, entity: &Entity, event: &ChangeEvent) -> usize {
        let regs = match self.registry.get(entity) {
            Some(r) => r,
            None => return 0,
        };

        let snapshot: Vec<Registration> = regs.value().clone();
        drop(regs);

        let mut invoked = 0;
        for reg in snapshot {
            if !reg.active.load(Ordering::SeqCst) {
                continue;
            }

            invoked += 1;
            let callback = reg.callback.clone();
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| callback(event))) {
                error!(
                    %entity,
                    subscriber = %reg.id,
                    panic = panic_message(payload.as_ref()),
                    "subscriber callback panicked"
                );
            }
        }

        invoked
    }
}

fn remove_registration(registry: &Registry, entity: &Entity, id: SubscriberId) -> bool {
    let mut removed = false;

    if let Some(mut regs) = registry.get_mut(entity) {
        if let Some(pos) = regs.iter().position(|r| r.id == id) {
            let reg = regs.remove(pos);
            reg.active.store(false, Ordering::SeqCst);
            removed = true;
        }
        let empty = regs.is_empty();
        drop(regs);
        if empty {
            registry.remove_if(entity, |_, v| v.is_empty());
        }
    }

    if removed {
        debug!(%entity, subscriber = %id, "unsubscribed");
    }
    removed
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Scoped registration. Dropping it unsubscribes unless it was detached.
#[must_use = "dropping a Subscription unsubscribes it immediately"]
pub struct Subscription {
    registry: Weak<Registry>,
    entity: Entity,
    id: SubscriberId,
    detached: bool,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    /// Safe to call repeatedly, and from inside a callback during dispatch.
    pub fn unsubscribe(&self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => remove_registration(&registry, &self.entity, self.id),
            None => false,
        }
    }

    /// Keeps the registration alive for the rest of the session.
    pub fn detach(mut self) -> SubscriberId {
        self.detached = true;
        self.id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.detached {
            self.unsubscribe();
        }
    }
}
