use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::RwLock;

use crate::{TenantId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static LISTENER_ID: AtomicU64 = AtomicU64::new(1);

fn next_listener_id() -> ListenerId {
    ListenerId(LISTENER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Transitions published by the session components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenancyEvent {
    SessionChanged { user_id: Option<UserId> },
    SignedOut,
    TenantsLoaded { user_id: UserId, count: usize },
    FetchRetryScheduled { retry_count: u32, delay_ms: u64, error: String },
    FetchFailed { error: String },
    TenantSelected { tenant_id: Option<TenantId> },
    ContextBound { tenant_id: TenantId },
    ContextBindFailed { tenant_id: TenantId, error: String },
    ContextCleared,
    RecoveryNeeded { error: String },
}

/// Event names without payload, used for subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TenancyEventKind {
    SessionChanged,
    SignedOut,
    TenantsLoaded,
    FetchRetryScheduled,
    FetchFailed,
    TenantSelected,
    ContextBound,
    ContextBindFailed,
    ContextCleared,
    RecoveryNeeded,
}

impl TenancyEvent {
    pub fn kind(&self) -> TenancyEventKind {
        match self {
            Self::SessionChanged { .. } => TenancyEventKind::SessionChanged,
            Self::SignedOut => TenancyEventKind::SignedOut,
            Self::TenantsLoaded { .. } => TenancyEventKind::TenantsLoaded,
            Self::FetchRetryScheduled { .. } => TenancyEventKind::FetchRetryScheduled,
            Self::FetchFailed { .. } => TenancyEventKind::FetchFailed,
            Self::TenantSelected { .. } => TenancyEventKind::TenantSelected,
            Self::ContextBound { .. } => TenancyEventKind::ContextBound,
            Self::ContextBindFailed { .. } => TenancyEventKind::ContextBindFailed,
            Self::ContextCleared => TenancyEventKind::ContextCleared,
            Self::RecoveryNeeded { .. } => TenancyEventKind::RecoveryNeeded,
        }
    }

    pub fn event_name(&self) -> &'static str {
        self.kind().name()
    }
}

impl TenancyEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionChanged => "session.changed",
            Self::SignedOut => "session.signed_out",
            Self::TenantsLoaded => "tenants.loaded",
            Self::FetchRetryScheduled => "tenants.retry_scheduled",
            Self::FetchFailed => "tenants.failed",
            Self::TenantSelected => "tenant.selected",
            Self::ContextBound => "context.bound",
            Self::ContextBindFailed => "context.bind_failed",
            Self::ContextCleared => "context.cleared",
            Self::RecoveryNeeded => "session.recovery_needed",
        }
    }
}

pub type EventListener = Arc<dyn Fn(&TenancyEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventPat {
    Any,
    Exact(TenancyEventKind),
}

impl EventPat {
    pub fn matches(&self, kind: TenancyEventKind) -> bool {
        match self {
            EventPat::Any => true,
            EventPat::Exact(k) => *k == kind,
        }
    }
}

#[derive(Clone)]
struct ListenerEntry {
    id: ListenerId,
    pattern: EventPat,
    listener: EventListener,
    once: bool,
}

/// Listener registry shared by the session components.
///
/// Emission is split so no lock is held while listeners run:
/// 1) snapshot matching listeners (read lock)
/// 2) call them (no lock)
/// 3) drop fired `once` listeners (write lock)
#[derive(Default)]
pub struct TenancyEventHub {
    listeners: RwLock<Vec<ListenerEntry>>,
}

impl TenancyEventHub {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn on(&self, pattern: EventPat, listener: EventListener) -> ListenerId {
        self.push(pattern, listener, false)
    }

    pub fn on_kind(&self, kind: TenancyEventKind, listener: EventListener) -> ListenerId {
        self.push(EventPat::Exact(kind), listener, false)
    }

    pub fn once(&self, pattern: EventPat, listener: EventListener) -> ListenerId {
        self.push(pattern, listener, true)
    }

    fn push(&self, pattern: EventPat, listener: EventListener, once: bool) -> ListenerId {
        let id = next_listener_id();
        self.listeners.write().push(ListenerEntry {
            id,
            pattern,
            listener,
            once,
        });
        id
    }

    pub fn off(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|e| e.id != id);
        before != listeners.len()
    }

    /// Remove all listeners, or only those registered with `pattern`.
    pub fn remove_all(&self, pattern: Option<EventPat>) -> usize {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        match pattern {
            Some(p) => listeners.retain(|e| e.pattern != p),
            None => listeners.clear(),
        }
        before - listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn emit(&self, event: &TenancyEvent) {
        let kind = event.kind();
        let (to_call, once_ids): (Vec<EventListener>, Vec<ListenerId>) = {
            let listeners = self.listeners.read();
            let mut to_call = Vec::new();
            let mut once_ids = Vec::new();
            for entry in listeners.iter().filter(|e| e.pattern.matches(kind)) {
                to_call.push(entry.listener.clone());
                if entry.once {
                    once_ids.push(entry.id);
                }
            }
            (to_call, once_ids)
        };

        for f in &to_call {
            f(event);
        }

        if !once_ids.is_empty() {
            self.listeners.write().retain(|e| !once_ids.contains(&e.id));
        }
    }
}
