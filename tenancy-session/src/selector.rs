//! Active tenant selection.

use std::sync::Arc;

use parking_lot::Mutex;
use tenancy_core::{ActiveTenantSelection, TenancyError, TenancyEvent, TenancyEventHub, TenancyResult, TenantId, TenantMembership};
use tokio::sync::watch;
use tracing::{debug, info};

/// Default pick: best role rank, then most recently created.
pub fn auto_select(available: &[TenantMembership]) -> Option<&TenantMembership> {
    available.iter().min_by(|a, b| {
        a.role
            .rank()
            .cmp(&b.role.rank())
            .then_with(|| b.created_at.cmp(&a.created_at))
    })
}

/// Keep `previous` if it is still a member of `available` (refreshing its
/// role), otherwise fall back to [`auto_select`].
pub fn reconcile(available: &[TenantMembership], previous: Option<&TenantId>) -> ActiveTenantSelection {
    if let Some(previous) = previous {
        if let Some(kept) = available.iter().find(|m| &m.tenant_id == previous) {
            return ActiveTenantSelection::of(kept);
        }
    }
    auto_select(available)
        .map(ActiveTenantSelection::of)
        .unwrap_or_default()
}

/// Stateful wrapper: remembers the last membership set and publishes the
/// selection through a `watch` channel.
///
/// `apply`, `switch_tenant` and `clear` hold the membership lock until the
/// new selection is published, so a reconcile can never publish a pick
/// derived from a selection that a concurrent switch already replaced.
pub struct TenantSelector {
    available: Mutex<Vec<TenantMembership>>,
    state: watch::Sender<ActiveTenantSelection>,
    events: Arc<TenancyEventHub>,
}

impl TenantSelector {
    pub fn new(events: Arc<TenancyEventHub>) -> Self {
        let (state, _) = watch::channel(ActiveTenantSelection::none());
        Self {
            available: Mutex::new(Vec::new()),
            state,
            events,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ActiveTenantSelection> {
        self.state.subscribe()
    }

    pub fn current(&self) -> ActiveTenantSelection {
        self.state.borrow().clone()
    }

    pub fn available(&self) -> Vec<TenantMembership> {
        self.available.lock().clone()
    }

    /// Reconcile against a freshly fetched membership set.
    pub fn apply(&self, available: &[TenantMembership]) -> ActiveTenantSelection {
        let (next, changed) = {
            let mut stored = self.available.lock();
            *stored = available.to_vec();
            let previous = self.current().tenant_id;
            let next = reconcile(available, previous.as_ref());
            debug!(
                previous = ?previous,
                selected = ?next.tenant_id,
                candidates = available.len(),
                "Reconciled tenant selection"
            );
            let changed = self.publish(&next);
            (next, changed)
        };
        self.announce(&next, changed);
        next
    }

    /// Make `tenant_id` active. Context binding is left to the caller.
    pub fn switch_tenant(&self, tenant_id: &TenantId) -> TenancyResult<ActiveTenantSelection> {
        let (next, changed) = {
            let available = self.available.lock();
            let membership = available
                .iter()
                .find(|m| &m.tenant_id == tenant_id)
                .ok_or_else(|| {
                    TenancyError::not_found(format!("Not a member of tenant {tenant_id}")).into_anyhow()
                })?;
            let next = ActiveTenantSelection::of(membership);
            let changed = self.publish(&next);
            (next, changed)
        };
        info!(tenant_id = %tenant_id, role = ?next.role, "Switched tenant");
        self.announce(&next, changed);
        Ok(next)
    }

    pub fn clear(&self) {
        let none = ActiveTenantSelection::none();
        let changed = {
            let mut available = self.available.lock();
            available.clear();
            self.publish(&none)
        };
        self.announce(&none, changed);
    }

    /// Store `next`; true when the active tenant id changed.
    fn publish(&self, next: &ActiveTenantSelection) -> bool {
        let mut tenant_changed = false;
        self.state.send_if_modified(|s| {
            if *s == *next {
                return false;
            }
            tenant_changed = s.tenant_id != next.tenant_id;
            *s = next.clone();
            true
        });
        tenant_changed
    }

    /// Listeners run outside the membership lock.
    fn announce(&self, next: &ActiveTenantSelection, tenant_changed: bool) {
        if tenant_changed {
            self.events.emit(&TenancyEvent::TenantSelected {
                tenant_id: next.tenant_id.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::Barrier;
    use tenancy_core::TenantRole;

    fn at(day: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap()
    }

    fn member(tenant: &str, role: &str, day: u32) -> TenantMembership {
        TenantMembership::new(format!("m-{tenant}"), tenant, role, at(day), format!("Tenant {tenant}"))
    }

    #[test]
    fn owner_outranks_recency() {
        let available = vec![member("x", "user", 1), member("y", "owner", 2)];
        let picked = auto_select(&available).unwrap();
        assert_eq!(picked.tenant_id, TenantId::from("y"));

        let older_owner = vec![member("x", "user", 9), member("y", "owner", 2)];
        assert_eq!(auto_select(&older_owner).unwrap().tenant_id, TenantId::from("y"));
    }

    #[test]
    fn ties_break_on_newest_membership() {
        let available = vec![member("a", "admin", 1), member("b", "admin", 5), member("c", "admin", 3)];
        assert_eq!(auto_select(&available).unwrap().tenant_id, TenantId::from("b"));
    }

    #[test]
    fn unknown_roles_rank_last() {
        let available = vec![member("a", "stylist", 9), member("b", "user", 1)];
        assert_eq!(auto_select(&available).unwrap().tenant_id, TenantId::from("b"));
    }

    #[test]
    fn reconcile_keeps_previous_and_refreshes_role() {
        let available = vec![member("a", "owner", 1), member("b", "user", 2)];
        let kept = reconcile(&available, Some(&TenantId::from("b")));
        assert_eq!(kept.tenant_id, Some(TenantId::from("b")));
        assert_eq!(kept.role, Some(TenantRole::User));
    }

    #[test]
    fn reconcile_falls_back_when_previous_vanished() {
        let available = vec![member("a", "admin", 1), member("b", "owner", 2)];
        let picked = reconcile(&available, Some(&TenantId::from("gone")));
        assert_eq!(picked.tenant_id, Some(TenantId::from("b")));
    }

    #[test]
    fn empty_set_selects_nothing() {
        assert_eq!(reconcile(&[], Some(&TenantId::from("a"))), ActiveTenantSelection::none());
        assert!(auto_select(&[]).is_none());
    }

    #[test]
    fn switch_rejects_unknown_tenant_and_keeps_selection() {
        let selector = TenantSelector::new(Arc::new(TenancyEventHub::new()));
        selector.apply(&[member("a", "owner", 1), member("b", "admin", 2)]);

        let err = selector.switch_tenant(&TenantId::from("zzz")).unwrap_err();
        assert_eq!(
            TenancyError::from_anyhow(&err).map(|e| e.kind),
            Some(tenancy_core::ErrorKind::NotFound)
        );
        assert_eq!(selector.current().tenant_id, Some(TenantId::from("a")));

        let switched = selector.switch_tenant(&TenantId::from("b")).unwrap();
        assert_eq!(switched.role, Some(TenantRole::Admin));
        assert_eq!(selector.current(), switched);
    }

    #[test]
    fn concurrent_reconcile_never_undoes_a_switch() {
        let set = vec![member("a", "owner", 1), member("c", "user", 3)];
        for _ in 0..2_000 {
            let selector = TenantSelector::new(Arc::new(TenancyEventHub::new()));
            selector.apply(&set);
            let barrier = Barrier::new(2);

            std::thread::scope(|scope| {
                scope.spawn(|| {
                    barrier.wait();
                    selector.apply(&set);
                });
                scope.spawn(|| {
                    barrier.wait();
                    selector.switch_tenant(&TenantId::from("c")).unwrap();
                });
            });

            assert_eq!(selector.current().tenant_id, Some(TenantId::from("c")));
        }
    }
}
