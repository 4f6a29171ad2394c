//! Zone responsibility and delegation integration tests
//!
//! Exercises assignment, delegation windows and effective-owner resolution
//! end to end through the store.

use chrono::{Duration, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use vigil::error::AppError;
use vigil::models::{Agent, CreateDelegationRequest};
use vigil::store::Store;

async fn setup_store() -> Store {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    Store::new(pool)
}

struct Fixture {
    store: Store,
    alice: Agent,
    bob: Agent,
    zone_id: uuid::Uuid,
}

/// Alice holds the zone, Bob is around to delegate to.
async fn setup_owned_zone() -> Fixture {
    let store = setup_store().await;
    let alice = store
        .create_agent("Alice", "alice@example.com", false)
        .await
        .unwrap();
    let bob = store
        .create_agent("Bob", "bob@example.com", false)
        .await
        .unwrap();
    let zone = store.create_zone("North Plant", "NORTH").await.unwrap();
    store
        .assign_zone(alice.id, zone.id, Utc::now())
        .await
        .unwrap();

    Fixture {
        store,
        alice,
        bob,
        zone_id: zone.id,
    }
}

fn delegation_request(f: &Fixture, starts_days: i64, ends_days: i64) -> CreateDelegationRequest {
    let now = Utc::now();
    CreateDelegationRequest {
        zone_id: f.zone_id,
        from_agent: f.alice.id,
        to_agent: f.bob.id,
        starts_at: now + Duration::days(starts_days),
        ends_at: now + Duration::days(ends_days),
        reason: "annual leave".to_string(),
    }
}

#[tokio::test]
async fn test_owner_resolution_follows_delegation_window() {
    let f = setup_owned_zone().await;
    let now = Utc::now();

    let monday = now + Duration::days(1);
    let wednesday = now + Duration::days(3);
    f.store
        .create_delegation(
            &CreateDelegationRequest {
                zone_id: f.zone_id,
                from_agent: f.alice.id,
                to_agent: f.bob.id,
                starts_at: monday,
                ends_at: wednesday,
                reason: "conference".to_string(),
            },
            f.alice.id,
            now,
        )
        .await
        .unwrap();

    // Before the window the permanent holder rules
    assert_eq!(
        f.store.resolve_owner(f.zone_id, now).await.unwrap(),
        Some(f.alice.id)
    );
    // The window start is inclusive
    assert_eq!(
        f.store.resolve_owner(f.zone_id, monday).await.unwrap(),
        Some(f.bob.id)
    );
    let tuesday = now + Duration::days(2);
    assert_eq!(
        f.store.resolve_owner(f.zone_id, tuesday).await.unwrap(),
        Some(f.bob.id)
    );
    // The window end is exclusive; responsibility reverts automatically
    assert_eq!(
        f.store.resolve_owner(f.zone_id, wednesday).await.unwrap(),
        Some(f.alice.id)
    );
}

#[tokio::test]
async fn test_overlapping_delegations_rejected() {
    let f = setup_owned_zone().await;
    let now = Utc::now();

    f.store
        .create_delegation(&delegation_request(&f, 1, 5), f.alice.id, now)
        .await
        .unwrap();

    // Partial overlap at the tail
    let result = f
        .store
        .create_delegation(&delegation_request(&f, 4, 8), f.alice.id, now)
        .await;
    assert!(matches!(result.unwrap_err(), AppError::Conflict(_)));

    // Fully contained window
    let result = f
        .store
        .create_delegation(&delegation_request(&f, 2, 3), f.alice.id, now)
        .await;
    assert!(matches!(result.unwrap_err(), AppError::Conflict(_)));
}

#[tokio::test]
async fn test_back_to_back_delegations_allowed() {
    let f = setup_owned_zone().await;
    let now = Utc::now();

    f.store
        .create_delegation(&delegation_request(&f, 1, 3), f.alice.id, now)
        .await
        .unwrap();
    // [1,3) and [3,5) share only the boundary instant
    f.store
        .create_delegation(&delegation_request(&f, 3, 5), f.alice.id, now)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_ended_delegation_frees_the_window() {
    let f = setup_owned_zone().await;
    let now = Utc::now();

    let first = f
        .store
        .create_delegation(&delegation_request(&f, 1, 5), f.alice.id, now)
        .await
        .unwrap();
    f.store.end_delegation(first.id).await.unwrap();

    // The revoked delegation no longer blocks the window
    f.store
        .create_delegation(&delegation_request(&f, 2, 4), f.alice.id, now)
        .await
        .unwrap();

    // Nor does it shift ownership while "in" its old window
    let in_old_window = now + Duration::hours(30);
    let owner = f.store.resolve_owner(f.zone_id, in_old_window).await.unwrap();
    assert_eq!(owner, Some(f.alice.id));
}

#[tokio::test]
async fn test_delegation_from_non_holder_rejected() {
    let f = setup_owned_zone().await;
    let now = Utc::now();

    let mut req = delegation_request(&f, 1, 3);
    req.from_agent = f.bob.id;
    req.to_agent = f.alice.id;

    let result = f.store.create_delegation(&req, f.bob.id, now).await;
    assert!(matches!(result.unwrap_err(), AppError::Conflict(_)));
}

#[tokio::test]
async fn test_delegation_interval_validation() {
    let f = setup_owned_zone().await;
    let now = Utc::now();

    // Ends before it starts
    let result = f
        .store
        .create_delegation(&delegation_request(&f, 3, 1), f.alice.id, now)
        .await;
    assert!(matches!(result.unwrap_err(), AppError::Validation(_)));

    // Zero-length window
    let result = f
        .store
        .create_delegation(&delegation_request(&f, 2, 2), f.alice.id, now)
        .await;
    assert!(matches!(result.unwrap_err(), AppError::Validation(_)));

    // Starts in the past
    let result = f
        .store
        .create_delegation(&delegation_request(&f, -1, 2), f.alice.id, now)
        .await;
    assert!(matches!(result.unwrap_err(), AppError::Validation(_)));

    // Blank reason
    let mut req = delegation_request(&f, 1, 2);
    req.reason = "  ".to_string();
    let result = f.store.create_delegation(&req, f.alice.id, now).await;
    assert!(matches!(result.unwrap_err(), AppError::Validation(_)));
}

#[tokio::test]
async fn test_update_delegation_window() {
    let f = setup_owned_zone().await;
    let now = Utc::now();

    let delegation = f
        .store
        .create_delegation(&delegation_request(&f, 1, 3), f.alice.id, now)
        .await
        .unwrap();

    let updated = f
        .store
        .update_delegation(
            delegation.id,
            now + Duration::days(2),
            now + Duration::days(6),
            "extended leave",
            now,
        )
        .await
        .unwrap();
    assert_eq!(updated.ends_at, now + Duration::days(6));
    assert_eq!(updated.reason, "extended leave");

    let fetched = f.store.get_delegation(delegation.id).await.unwrap();
    assert_eq!(fetched.ends_at, now + Duration::days(6));
}

#[tokio::test]
async fn test_update_delegation_cannot_overlap_sibling() {
    let f = setup_owned_zone().await;
    let now = Utc::now();

    let first = f
        .store
        .create_delegation(&delegation_request(&f, 1, 3), f.alice.id, now)
        .await
        .unwrap();
    f.store
        .create_delegation(&delegation_request(&f, 5, 7), f.alice.id, now)
        .await
        .unwrap();

    let result = f
        .store
        .update_delegation(
            first.id,
            now + Duration::days(1),
            now + Duration::days(6),
            "stretch",
            now,
        )
        .await;
    assert!(matches!(result.unwrap_err(), AppError::Conflict(_)));
}

#[tokio::test]
async fn test_update_ended_delegation_rejected() {
    let f = setup_owned_zone().await;
    let now = Utc::now();

    let delegation = f
        .store
        .create_delegation(&delegation_request(&f, 1, 3), f.alice.id, now)
        .await
        .unwrap();
    f.store.end_delegation(delegation.id).await.unwrap();

    let result = f
        .store
        .update_delegation(
            delegation.id,
            now + Duration::days(1),
            now + Duration::days(4),
            "never mind",
            now,
        )
        .await;
    assert!(matches!(result.unwrap_err(), AppError::Conflict(_)));
}

#[tokio::test]
async fn test_delegation_to_unknown_agent_rejected() {
    let f = setup_owned_zone().await;
    let now = Utc::now();

    let mut req = delegation_request(&f, 1, 3);
    req.to_agent = uuid::Uuid::new_v4();
    let result = f.store.create_delegation(&req, f.alice.id, now).await;
    assert!(matches!(result.unwrap_err(), AppError::NotFound(_)));
}

#[tokio::test]
async fn test_revoked_zone_resolves_to_nobody() {
    let f = setup_owned_zone().await;
    let now = Utc::now();

    f.store.revoke_zone(f.alice.id, f.zone_id, now).await.unwrap();
    assert_eq!(f.store.resolve_owner(f.zone_id, now).await.unwrap(), None);
}

#[tokio::test]
async fn test_list_delegations_for_zone() {
    let f = setup_owned_zone().await;
    let now = Utc::now();

    f.store
        .create_delegation(&delegation_request(&f, 4, 6), f.alice.id, now)
        .await
        .unwrap();
    f.store
        .create_delegation(&delegation_request(&f, 1, 3), f.alice.id, now)
        .await
        .unwrap();

    let delegations = f.store.list_delegations_for_zone(f.zone_id).await.unwrap();
    assert_eq!(delegations.len(), 2);
    // Ordered by start
    assert!(delegations[0].starts_at < delegations[1].starts_at);
}

#[tokio::test]
async fn test_effective_owner_is_exclusive_for_management() {
    let f = setup_owned_zone().await;
    let now = Utc::now();

    let report = f
        .store
        .create_report(f.zone_id, "Oil spill", "Bay 4", f.alice.id, now)
        .await
        .unwrap();

    f.store
        .create_delegation(&delegation_request(&f, 1, 3), f.alice.id, now)
        .await
        .unwrap();

    // Before the window: Alice manages, Bob does not
    assert!(f.store.can_manage(f.alice.id, report.id, now).await.unwrap());
    assert!(!f.store.can_manage(f.bob.id, report.id, now).await.unwrap());

    // Inside the window authority flips entirely
    let during = now + Duration::days(2);
    assert!(!f.store.can_manage(f.alice.id, report.id, during).await.unwrap());
    assert!(f.store.can_manage(f.bob.id, report.id, during).await.unwrap());

    // After it flips back
    let after = now + Duration::days(4);
    assert!(f.store.can_manage(f.alice.id, report.id, after).await.unwrap());
    assert!(!f.store.can_manage(f.bob.id, report.id, after).await.unwrap());
}

#[tokio::test]
async fn test_admin_can_manage_without_ownership() {
    let f = setup_owned_zone().await;
    let now = Utc::now();
    let admin = f
        .store
        .create_agent("Root", "root@example.com", true)
        .await
        .unwrap();

    let report = f
        .store
        .create_report(f.zone_id, "Oil spill", "Bay 4", f.alice.id, now)
        .await
        .unwrap();

    assert!(f.store.can_manage(admin.id, report.id, now).await.unwrap());
    assert!(f.store.can_abort(admin.id, report.id, now).await.unwrap());
}

#[tokio::test]
async fn test_report_creation_requires_effective_ownership() {
    let f = setup_owned_zone().await;
    let now = Utc::now();

    // Bob holds nothing yet
    let result = f
        .store
        .create_report(f.zone_id, "Near miss", "Dock 2", f.bob.id, now)
        .await;
    assert!(matches!(result.unwrap_err(), AppError::Permission(_)));

    // During his delegation window he files reports; Alice cannot
    f.store
        .create_delegation(&delegation_request(&f, 1, 3), f.alice.id, now)
        .await
        .unwrap();
    let during = now + Duration::days(2);

    f.store
        .create_report(f.zone_id, "Near miss", "Dock 2", f.bob.id, during)
        .await
        .unwrap();
    let result = f
        .store
        .create_report(f.zone_id, "Near miss", "Dock 2", f.alice.id, during)
        .await;
    assert!(matches!(result.unwrap_err(), AppError::Permission(_)));
}
