//! Reservation ledger behavior: conflict control, authorization, and the
//! explicit status lifecycle.

use time::OffsetDateTime;
use toolshare_core::{
    parse_rfc3339_utc, DateRange, DomainError, RegistrationInput, ReservationStatus, ToolId,
    UserId,
};
use toolshare_store_sqlite::{SqliteStore, StoreError};

fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("expected Ok(..), got error: {err}"),
    }
}

fn domain_err<T: std::fmt::Debug>(result: Result<T, StoreError>) -> DomainError {
    match result {
        Ok(value) => panic!("expected domain error, got {value:?}"),
        Err(err) => match err.as_domain() {
            Some(domain) => domain.clone(),
            None => panic!("expected domain error, got {err}"),
        },
    }
}

fn utc(value: &str) -> OffsetDateTime {
    must_ok(parse_rfc3339_utc(value))
}

fn range(start: &str, end: &str) -> DateRange {
    must_ok(DateRange::new(utc(start), utc(end)))
}

fn store() -> SqliteStore {
    let store = must_ok(SqliteStore::open_in_memory());
    must_ok(store.migrate());
    store
}

fn register(store: &mut SqliteStore, name: &str) -> UserId {
    let user = must_ok(store.register_user(&RegistrationInput {
        username: name.to_string(),
        email: format!("{name}@example.com"),
        password: "pw".to_string(),
    }));
    user.user_id
}

/// One owner with a listed tool, plus a borrower.
fn fixture(store: &mut SqliteStore) -> (UserId, UserId, ToolId) {
    let owner = register(store, "owner");
    let borrower = register(store, "borrower");
    let tool = must_ok(store.add_tool(owner, "cordless drill", "18V", "power tools"));
    (owner, borrower, tool.tool_id)
}

#[test]
fn owner_cannot_reserve_own_tool() {
    let mut store = store();
    let (owner, _, tool) = fixture(&mut store);

    let err = domain_err(store.create_reservation(
        tool,
        owner,
        range("2024-06-01T00:00:00Z", "2024-06-05T00:00:00Z"),
    ));
    assert_eq!(err, DomainError::SelfBooking);
}

#[test]
fn overlapping_reservation_is_rejected_in_either_order() {
    let mut store = store();
    let (_, borrower, tool) = fixture(&mut store);
    let other = register(&mut store, "other");

    let first = must_ok(store.create_reservation(
        tool,
        borrower,
        range("2024-06-01T00:00:00Z", "2024-06-05T00:00:00Z"),
    ));

    let err = domain_err(store.create_reservation(
        tool,
        other,
        range("2024-06-03T00:00:00Z", "2024-06-04T00:00:00Z"),
    ));
    assert_eq!(
        err,
        DomainError::BookingConflict {
            conflicting: first.reservation_id
        }
    );

    // The same borrower re-requesting their own window is also a conflict.
    let err = domain_err(store.create_reservation(
        tool,
        borrower,
        range("2024-06-03T00:00:00Z", "2024-06-04T00:00:00Z"),
    ));
    assert!(matches!(err, DomainError::BookingConflict { .. }));
}

#[test]
fn touching_endpoints_coexist_but_straddle_is_rejected() {
    let mut store = store();
    let (_, borrower, tool) = fixture(&mut store);
    let other = register(&mut store, "other");

    let a = must_ok(store.create_reservation(
        tool,
        borrower,
        range("2024-06-01T00:00:00Z", "2024-06-05T00:00:00Z"),
    ));
    let b = must_ok(store.create_reservation(
        tool,
        other,
        range("2024-06-05T00:00:00Z", "2024-06-10T00:00:00Z"),
    ));
    assert_ne!(a.reservation_id, b.reservation_id);

    let err = domain_err(store.create_reservation(
        tool,
        borrower,
        range("2024-06-04T00:00:00Z", "2024-06-06T00:00:00Z"),
    ));
    assert!(matches!(err, DomainError::BookingConflict { .. }));
}

#[test]
fn cancelled_and_completed_reservations_do_not_block() {
    let mut store = store();
    let (owner, borrower, tool) = fixture(&mut store);
    let other = register(&mut store, "other");
    let window = range("2024-06-01T00:00:00Z", "2024-06-05T00:00:00Z");

    let first = must_ok(store.create_reservation(tool, borrower, window));
    must_ok(store.update_reservation_status(
        first.reservation_id,
        ReservationStatus::Cancelled,
        owner,
        false,
    ));

    // Same window is free again after cancellation.
    let second = must_ok(store.create_reservation(tool, other, window));

    must_ok(store.update_reservation_status(
        second.reservation_id,
        ReservationStatus::Approved,
        owner,
        false,
    ));
    must_ok(store.update_reservation_status(
        second.reservation_id,
        ReservationStatus::Completed,
        owner,
        false,
    ));

    // And again after completion.
    must_ok(store.create_reservation(tool, borrower, window));
}

#[test]
fn missing_tool_and_borrower_are_not_found() {
    let mut store = store();
    let (_, borrower, tool) = fixture(&mut store);
    let window = range("2024-06-01T00:00:00Z", "2024-06-05T00:00:00Z");

    let err = domain_err(store.create_reservation(ToolId(999), borrower, window));
    assert_eq!(
        err,
        DomainError::NotFound {
            entity: "tool",
            id: 999
        }
    );

    let err = domain_err(store.create_reservation(tool, UserId(999), window));
    assert_eq!(
        err,
        DomainError::NotFound {
            entity: "user",
            id: 999
        }
    );
}

#[test]
fn status_update_requires_owner_or_admin() {
    let mut store = store();
    let (owner, borrower, tool) = fixture(&mut store);
    let stranger = register(&mut store, "stranger");

    let reservation = must_ok(store.create_reservation(
        tool,
        borrower,
        range("2024-06-01T00:00:00Z", "2024-06-05T00:00:00Z"),
    ));

    // The borrower cannot approve their own request, and neither can a
    // bystander; both get an explicit rejection rather than a silent no-op.
    for actor in [borrower, stranger] {
        let err = domain_err(store.update_reservation_status(
            reservation.reservation_id,
            ReservationStatus::Approved,
            actor,
            false,
        ));
        assert!(matches!(err, DomainError::Unauthorized { .. }));
    }
    let unchanged = must_ok(store.get_reservation(reservation.reservation_id));
    assert_eq!(unchanged.status, ReservationStatus::Pending);

    must_ok(store.update_reservation_status(
        reservation.reservation_id,
        ReservationStatus::Approved,
        owner,
        false,
    ));

    // An admin who owns nothing may advance it further.
    let admin = register(&mut store, "admin");
    let updated = must_ok(store.update_reservation_status(
        reservation.reservation_id,
        ReservationStatus::Completed,
        admin,
        true,
    ));
    assert_eq!(updated.status, ReservationStatus::Completed);
}

#[test]
fn illegal_transitions_are_rejected() {
    let mut store = store();
    let (owner, borrower, tool) = fixture(&mut store);

    let reservation = must_ok(store.create_reservation(
        tool,
        borrower,
        range("2024-06-01T00:00:00Z", "2024-06-05T00:00:00Z"),
    ));

    // pending -> completed skips approval.
    let err = domain_err(store.update_reservation_status(
        reservation.reservation_id,
        ReservationStatus::Completed,
        owner,
        false,
    ));
    assert_eq!(
        err,
        DomainError::InvalidTransition {
            from: ReservationStatus::Pending,
            to: ReservationStatus::Completed,
        }
    );

    must_ok(store.update_reservation_status(
        reservation.reservation_id,
        ReservationStatus::Cancelled,
        owner,
        false,
    ));

    // Terminal states accept nothing.
    let err = domain_err(store.update_reservation_status(
        reservation.reservation_id,
        ReservationStatus::Approved,
        owner,
        false,
    ));
    assert!(matches!(err, DomainError::InvalidTransition { .. }));
}

#[test]
fn deletion_is_for_borrower_or_admin_only() {
    let mut store = store();
    let (owner, borrower, tool) = fixture(&mut store);

    let reservation = must_ok(store.create_reservation(
        tool,
        borrower,
        range("2024-06-01T00:00:00Z", "2024-06-05T00:00:00Z"),
    ));

    // The tool owner is not the borrower and may not delete the request.
    let err = domain_err(store.delete_reservation(reservation.reservation_id, owner, false));
    assert!(matches!(err, DomainError::Unauthorized { .. }));

    must_ok(store.delete_reservation(reservation.reservation_id, borrower, false));
    let err = domain_err(store.get_reservation(reservation.reservation_id));
    assert!(matches!(err, DomainError::NotFound { .. }));

    let err = domain_err(store.delete_reservation(reservation.reservation_id, borrower, false));
    assert!(matches!(err, DomainError::NotFound { .. }));
}

#[test]
fn reservations_on_different_tools_never_conflict() {
    let mut store = store();
    let (owner, borrower, tool) = fixture(&mut store);
    let second_tool = must_ok(store.add_tool(owner, "angle grinder", "", "power tools"));
    let window = range("2024-06-01T00:00:00Z", "2024-06-05T00:00:00Z");

    must_ok(store.create_reservation(tool, borrower, window));
    must_ok(store.create_reservation(second_tool.tool_id, borrower, window));
}
