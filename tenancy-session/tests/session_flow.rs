use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use tenancy_core::{
    ActiveTenantSelection, EventPat, Session, TenancyEvent, TenantContextBinding, TenantId, TenantMembership,
    TenantRole, User,
};
use tenancy_session::backend::memory::{Failure, MemoryAuthProvider, MemoryContextProcedures, MemoryMembershipSource};
use tenancy_session::{FetchState, SessionOptions, TenantSession};

/// Test factory functions
fn session_for(user: &str) -> Session {
    Session::new(User::new(user), "access-0", Utc::now() + chrono::Duration::hours(1)).with_refresh_token("refresh-0")
}

fn membership(tenant: &str, role: &str, day: u32) -> TenantMembership {
    let created = Utc.with_ymd_and_hms(2024, 6, day, 8, 30, 0).unwrap();
    TenantMembership::new(format!("m-{tenant}"), tenant, role, created, format!("Tenant {tenant}"))
}

struct Harness {
    auth: Arc<MemoryAuthProvider>,
    source: Arc<MemoryMembershipSource>,
    procedures: Arc<MemoryContextProcedures>,
    session: TenantSession,
    events: Arc<Mutex<Vec<TenancyEvent>>>,
}

fn harness(signed_in_as: Option<&str>) -> Harness {
    let auth = match signed_in_as {
        Some(user) => MemoryAuthProvider::new().with_session(session_for(user)),
        None => MemoryAuthProvider::new(),
    };
    let auth = Arc::new(auth);
    let source = Arc::new(MemoryMembershipSource::new());
    let procedures = Arc::new(MemoryContextProcedures::new());
    let session = TenantSession::new(
        auth.clone(),
        source.clone(),
        procedures.clone(),
        SessionOptions::default(),
    )
    .unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    session
        .events()
        .on(EventPat::Any, Arc::new(move |e: &TenancyEvent| sink.lock().push(e.clone())));

    Harness {
        auth,
        source,
        procedures,
        session,
        events,
    }
}

/// Standard membership set: owner of "a" (oldest), admin of "b", user of "c" (newest).
fn seed(source: &MemoryMembershipSource, user: &str) {
    source.add_membership(user, membership("a", "owner", 1));
    source.add_membership(user, membership("b", "admin", 2));
    source.add_membership(user, membership("c", "user", 3));
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(60), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

fn tenant(id: &str) -> Option<TenantId> {
    Some(TenantId::from(id))
}

#[tokio::test(start_paused = true)]
async fn test_start_loads_tenants_and_auto_selects_owner() {
    let h = harness(Some("u-1"));
    seed(&h.source, "u-1");

    h.session.start().await;
    eventually("auto-selection", || h.session.active_tenant().tenant_id == tenant("a")).await;

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.tenants.available_tenants.len(), 3);
    assert_eq!(snapshot.selection.role, Some(TenantRole::Owner));
    assert!(!snapshot.needs_recovery);

    // Selection never binds on its own
    assert_eq!(snapshot.context, TenantContextBinding::default());
    assert_eq!(h.procedures.bind_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_selection_is_sticky_across_refetch() {
    let h = harness(Some("u-1"));
    seed(&h.source, "u-1");
    h.session.start().await;
    eventually("auto-selection", || h.session.active_tenant().is_selected()).await;

    let switched = h.session.switch_tenant(&TenantId::from("c")).unwrap();
    assert_eq!(switched.role, Some(TenantRole::User));

    h.source.add_membership("u-1", membership("d", "owner", 4));
    h.session.fetch_user_tenants().await;
    eventually("reconcile", || h.session.selector().available().len() == 4).await;
    assert_eq!(h.session.active_tenant().tenant_id, tenant("c"));

    h.source.remove_membership(&"u-1".into(), &TenantId::from("c"));
    h.session.fetch_user_tenants().await;
    eventually("fallback", || h.session.active_tenant().tenant_id != tenant("c")).await;
    // Owners tie on rank; "d" is the newer membership
    assert_eq!(h.session.active_tenant().tenant_id, tenant("d"));
}

#[tokio::test(start_paused = true)]
async fn test_empty_membership_set_is_not_an_error() {
    let h = harness(Some("u-1"));
    h.session.start().await;
    eventually("fetch", || h.source.call_count() == 1 && !h.session.fetcher().state().is_loading).await;

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.selection, ActiveTenantSelection::none());
    assert_eq!(snapshot.tenants.error, None);
}

#[tokio::test(start_paused = true)]
async fn test_switch_to_unknown_tenant_is_rejected() {
    let h = harness(Some("u-1"));
    seed(&h.source, "u-1");
    h.session.start().await;
    eventually("auto-selection", || h.session.active_tenant().is_selected()).await;

    assert!(h.session.switch_tenant(&TenantId::from("nope")).is_err());
    assert!(!h.session.switch_and_bind(&TenantId::from("nope")).await);
    assert_eq!(h.session.active_tenant().tenant_id, tenant("a"));
    assert_eq!(h.procedures.bind_count(), 0);
}

/// A refused bind leaves the connection unscoped
#[tokio::test(start_paused = true)]
async fn test_failed_bind_leaves_context_unset() {
    let h = harness(Some("u-1"));
    seed(&h.source, "u-1");
    h.procedures.allow_only(["a"]);
    h.session.start().await;
    eventually("auto-selection", || h.session.active_tenant().is_selected()).await;

    assert!(h.session.switch_and_bind(&TenantId::from("a")).await);
    assert!(h.session.snapshot().context.is_context_set);

    assert!(!h.session.switch_and_bind(&TenantId::from("b")).await);
    let context = h.session.snapshot().context;
    assert!(!context.is_context_set);
    assert_eq!(context.current_tenant_id, None);
    assert!(context.error.unwrap().contains("permission denied"));
    // The switch itself happened; only the bind was refused
    assert_eq!(h.session.active_tenant().tenant_id, tenant("b"));

    assert!(h
        .events
        .lock()
        .iter()
        .any(|e| matches!(e, TenancyEvent::ContextBindFailed { tenant_id, .. } if tenant_id.as_str() == "b")));
}

/// Losing the session clears tenants, selection and binding without an error
#[tokio::test(start_paused = true)]
async fn test_logout_clears_everything() {
    let h = harness(Some("u-1"));
    seed(&h.source, "u-1");
    h.session.start().await;
    eventually("auto-selection", || h.session.active_tenant().is_selected()).await;
    assert!(h.session.set_tenant_context(&TenantId::from("a")).await);

    h.auth.sign_out();
    eventually("logout", || !h.session.active_tenant().is_selected()).await;

    let snapshot = h.session.snapshot();
    assert!(snapshot.session.user.is_none());
    assert_eq!(snapshot.session.error, None);
    assert_eq!(snapshot.tenants, FetchState::default());
    assert_eq!(snapshot.selection, ActiveTenantSelection::none());
    assert_eq!(snapshot.context, TenantContextBinding::default());
    assert!(!snapshot.needs_recovery);

    let events = h.events.lock();
    assert!(events.iter().any(|e| matches!(e, TenancyEvent::SignedOut)));
    assert!(events.iter().any(|e| matches!(e, TenancyEvent::ContextCleared)));
}

#[tokio::test(start_paused = true)]
async fn test_token_refresh_does_not_refetch() {
    let h = harness(Some("u-1"));
    seed(&h.source, "u-1");
    h.session.start().await;
    eventually("first fetch", || h.session.active_tenant().is_selected()).await;
    assert_eq!(h.source.call_count(), 1);

    let refreshed = h.auth.refresh_token().unwrap();
    eventually("token refresh", || h.session.snapshot().session.session.as_ref() == Some(&refreshed)).await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(h.source.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_sign_in_refetches() {
    let h = harness(Some("u-1"));
    seed(&h.source, "u-1");
    h.session.start().await;
    eventually("first fetch", || h.session.active_tenant().is_selected()).await;
    assert_eq!(h.source.call_count(), 1);

    h.source.add_membership("u-1", membership("d", "owner", 4));
    h.auth.sign_in(session_for("u-1"));
    eventually("refetch", || h.session.available_tenants().len() == 4).await;

    assert_eq!(h.source.call_count(), 2);
    assert_eq!(h.session.snapshot().session.sign_ins, 1);
    // Same user, so the selection stays where it was
    assert_eq!(h.session.active_tenant().tenant_id, tenant("a"));
}

#[tokio::test(start_paused = true)]
async fn test_new_identity_refetches() {
    let h = harness(None);
    seed(&h.source, "u-1");
    h.source.add_membership("u-2", membership("z", "admin", 9));
    h.session.start().await;
    assert_eq!(h.source.call_count(), 0);

    h.auth.sign_in(session_for("u-1"));
    eventually("u-1 tenants", || h.session.active_tenant().tenant_id == tenant("a")).await;

    h.auth.sign_in(session_for("u-2"));
    eventually("u-2 tenants", || h.session.active_tenant().tenant_id == tenant("z")).await;
    assert_eq!(h.session.available_tenants().len(), 1);
    assert_eq!(h.source.call_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_auth_recovery_refetches_after_debounce() {
    let h = harness(Some("u-1"));
    seed(&h.source, "u-1");
    h.session.start().await;
    eventually("first fetch", || h.session.active_tenant().is_selected()).await;

    // Reconnect pull fails; the cached user is kept but auth is in error
    h.auth.fail_next_get_session(Failure::unavailable("network unreachable"));
    h.session.tracker().start().await;
    eventually("auth guard", || h.session.fetcher().state().auth_required).await;
    assert!(h.session.available_tenants().is_empty());

    h.auth.refresh_token();
    eventually("auth recovered", || h.session.snapshot().session.error.is_none()).await;

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(h.source.call_count(), 1);

    eventually("debounced refetch", || h.session.available_tenants().len() == 3).await;
    assert_eq!(h.source.call_count(), 2);
    assert_eq!(h.session.fetcher().state().error, None);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_auth_failure_raises_recovery_flag() {
    let h = harness(Some("u-1"));
    seed(&h.source, "u-1");
    h.source.fail_next(Failure::jwt_expired());
    h.session.start().await;
    eventually("auth-required fetch", || h.session.fetcher().state().auth_required).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!h.session.snapshot().needs_recovery);

    let mut flag = h.session.subscribe_needs_recovery();
    tokio::time::timeout(Duration::from_secs(10), flag.wait_for(|needed| *needed))
        .await
        .expect("grace period elapsed")
        .unwrap();
    assert!(h
        .events
        .lock()
        .iter()
        .any(|e| matches!(e, TenancyEvent::RecoveryNeeded { .. })));

    h.session.fetch_user_tenants().await;
    eventually("recovery", || !h.session.snapshot().needs_recovery).await;
    assert_eq!(h.session.available_tenants().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_failed_force_recovery_signs_out() {
    let h = harness(Some("u-1"));
    seed(&h.source, "u-1");
    h.session.start().await;
    eventually("auto-selection", || h.session.active_tenant().is_selected()).await;

    h.auth.fail_next_refresh(Failure::not_authenticated("Invalid Refresh Token: Already Used"));
    assert!(!h.session.force_session_recovery().await);

    eventually("cleared", || !h.session.active_tenant().is_selected()).await;
    assert!(h.session.available_tenants().is_empty());
    assert!(h.auth.clear_count() >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_reacting() {
    let h = harness(None);
    seed(&h.source, "u-1");
    h.session.start().await;
    h.session.shutdown();

    h.auth.sign_in(session_for("u-1"));
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(h.source.call_count(), 0);
    assert!(!h.session.active_tenant().is_selected());
}

#[tokio::test]
async fn test_invalid_options_are_rejected() {
    let options = SessionOptions::default().with_auth_grace_period(Duration::from_millis(10));
    let result = TenantSession::new(
        Arc::new(MemoryAuthProvider::new()),
        Arc::new(MemoryMembershipSource::new()),
        Arc::new(MemoryContextProcedures::new()),
        options,
    );
    assert!(result.is_err());
}
