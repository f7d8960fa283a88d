//! Observer interface for core notifications.
//!
//! Observers subscribe to one [`EventKind`] and get a [`SubscriptionToken`]
//! back to unsubscribe with. Handlers run synchronously on the emitting task
//! and must not block.

use log::trace;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::cache::EvictionReason;
use crate::offline::SearchMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ModeChanged,
    CacheCleared,
    CacheEvicted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoreEvent {
    ModeChanged {
        from: SearchMode,
        to: SearchMode,
        reason: Option<String>,
    },
    CacheCleared {
        removed: usize,
    },
    CacheEvicted {
        key: String,
        reason: EvictionReason,
    },
}

impl CoreEvent {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::ModeChanged { .. } => EventKind::ModeChanged,
            Self::CacheCleared { .. } => EventKind::CacheCleared,
            Self::CacheEvicted { .. } => EventKind::CacheEvicted,
        }
    }
}

/// Handle returned by [`EventHub::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken {
    kind: EventKind,
    id: u64,
}

type Handler = Arc<dyn Fn(&CoreEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventHub {
    handlers: Mutex<HashMap<EventKind, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub").finish_non_exhaustive()
    }
}

impl EventHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        kind: EventKind,
        handler: impl Fn(&CoreEvent) + Send + Sync + 'static,
    ) -> SubscriptionToken {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push((id, Arc::new(handler)));
        SubscriptionToken { kind, id }
    }

    /// Returns `false` if the token was already unsubscribed
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = handlers.get_mut(&token.kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != token.id);
        before != list.len()
    }

    pub fn emit(&self, event: &CoreEvent) {
        // Call outside the lock so handlers may (un)subscribe
        let targets: Vec<Handler> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        trace!("Emitting {:?} to {} handlers", event.kind(), targets.len());
        for handler in targets {
            handler(event);
        }
    }

    #[must_use]
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_handlers_only_see_their_kind() {
        let hub = EventHub::new();
        let cleared = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cleared);
        hub.subscribe(EventKind::CacheCleared, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        hub.emit(&CoreEvent::CacheCleared { removed: 3 });
        hub.emit(&CoreEvent::ModeChanged {
            from: SearchMode::Online,
            to: SearchMode::Offline,
            reason: None,
        });

        assert_eq!(cleared.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let hub = EventHub::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let token = hub.subscribe(EventKind::CacheEvicted, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let event = CoreEvent::CacheEvicted {
            key: "radiohead".to_string(),
            reason: EvictionReason::Expired,
        };
        hub.emit(&event);
        assert!(hub.unsubscribe(token));
        assert!(!hub.unsubscribe(token), "second unsubscribe is a no-op");
        hub.emit(&event);

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(hub.subscriber_count(EventKind::CacheEvicted), 0);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(CoreEvent::CacheEvicted {
            key: "k".to_string(),
            reason: EvictionReason::Capacity,
        })
        .unwrap();
        assert_eq!(json["event"], "cache_evicted");
        assert_eq!(json["reason"], "capacity");
    }
}
