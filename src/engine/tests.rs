use std::path::PathBuf;
use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use futures::FutureExt;

use super::*;
use crate::booking::{BookingWriter, RetryPolicy};
use crate::error::Entity;
use crate::store::{Directory, EntityStore, UnitOfWork};

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("tablebook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 5, 17).unwrap()
}

fn time(h: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, 0, 0).unwrap()
}

fn writer(engine: &Arc<Engine>) -> BookingWriter<Arc<Engine>> {
    BookingWriter::with_retry(
        engine.clone(),
        RetryPolicy { max_attempts: 20, backoff: Duration::from_millis(1) },
    )
}

async fn user(engine: &Arc<Engine>, email: &str) -> UserId {
    engine
        .create_user(NewUser {
            email: email.into(),
            first_name: "Ann".into(),
            last_name: "Lee".into(),
        })
        .await
        .unwrap()
}

async fn table(engine: &Arc<Engine>, number: i32, capacity: i32) -> TableId {
    engine
        .create_table(NewTable { table_number: number, capacity })
        .await
        .unwrap()
}

fn booking(user_id: UserId, table_id: TableId, hour: u32, guests: i32) -> NewBooking {
    NewBooking {
        user_id,
        table_id,
        booking_date: date(),
        booking_time: time(hour),
        guests_count: guests,
    }
}

async fn slot_total(engine: &Engine, table_id: TableId, hour: u32) -> i64 {
    let state = engine.get_table_state(&table_id).unwrap();
    let guard = state.read().await;
    guard.occupancy(date(), time(hour), None)
}

// ── Capacity scenarios ───────────────────────────────────

#[tokio::test]
async fn second_booking_over_capacity_rejected() {
    let engine = Arc::new(Engine::new(test_wal_path("scenario_a.wal")).unwrap());
    let w = writer(&engine);
    let u = user(&engine, "a@example.com").await;
    let t = table(&engine, 1, 4).await;

    w.create_booking(booking(u, t, 19, 3)).await.unwrap();
    let err = w.create_booking(booking(u, t, 19, 2)).await.unwrap_err();
    assert!(matches!(
        err,
        Error::CapacityExceeded { occupied: 3, capacity: 4, requested: 2 }
    ));
    assert_eq!(engine.list_bookings().await.unwrap().len(), 1);
}

#[tokio::test]
async fn other_slots_are_independent() {
    let engine = Arc::new(Engine::new(test_wal_path("independent_slots.wal")).unwrap());
    let w = writer(&engine);
    let u = user(&engine, "slots@example.com").await;
    let t = table(&engine, 1, 4).await;

    w.create_booking(booking(u, t, 19, 4)).await.unwrap();
    w.create_booking(booking(u, t, 20, 4)).await.unwrap();
    let mut next_day = booking(u, t, 19, 4);
    next_day.booking_date = date().succ_opt().unwrap();
    w.create_booking(next_day).await.unwrap();
}

#[tokio::test]
async fn update_to_full_capacity_excludes_itself() {
    let engine = Arc::new(Engine::new(test_wal_path("scenario_b.wal")).unwrap());
    let w = writer(&engine);
    let u = user(&engine, "b@example.com").await;
    let t = table(&engine, 1, 4).await;
    let id = w.create_booking(booking(u, t, 19, 3)).await.unwrap();

    let patch = BookingPatch { guests_count: Some(4), ..Default::default() };
    assert!(w.update_booking(id, patch).await.unwrap());
    assert_eq!(engine.find_booking(id).await.unwrap().unwrap().guests_count, 4);
    assert_eq!(slot_total(&engine, t, 19).await, 4);
}

#[tokio::test]
async fn shrinking_a_full_booking_succeeds() {
    let engine = Arc::new(Engine::new(test_wal_path("shrink_full.wal")).unwrap());
    let w = writer(&engine);
    let u = user(&engine, "shrink@example.com").await;
    let t = table(&engine, 1, 4).await;
    let id = w.create_booking(booking(u, t, 19, 4)).await.unwrap();

    let patch = BookingPatch { guests_count: Some(2), ..Default::default() };
    assert!(w.update_booking(id, patch).await.unwrap());
    assert_eq!(slot_total(&engine, t, 19).await, 2);
}

#[tokio::test]
async fn update_growing_past_capacity_rejected() {
    let engine = Arc::new(Engine::new(test_wal_path("grow_past.wal")).unwrap());
    let w = writer(&engine);
    let u = user(&engine, "grow@example.com").await;
    let t = table(&engine, 1, 4).await;
    w.create_booking(booking(u, t, 19, 2)).await.unwrap();
    let id = w.create_booking(booking(u, t, 19, 1)).await.unwrap();

    let patch = BookingPatch { guests_count: Some(3), ..Default::default() };
    let err = w.update_booking(id, patch).await.unwrap_err();
    assert!(matches!(
        err,
        Error::CapacityExceeded { occupied: 2, capacity: 4, requested: 3 }
    ));
    assert_eq!(engine.find_booking(id).await.unwrap().unwrap().guests_count, 1);
}

#[tokio::test]
async fn large_party_fits_a_large_table() {
    let engine = Arc::new(Engine::new(test_wal_path("large_party.wal")).unwrap());
    let w = writer(&engine);
    let u = user(&engine, "banquet@example.com").await;
    let t = table(&engine, 1, 50_000).await;

    w.create_booking(booking(u, t, 19, 20_000)).await.unwrap();
    w.create_booking(booking(u, t, 19, 30_000)).await.unwrap();
    let err = w.create_booking(booking(u, t, 19, 1)).await.unwrap_err();
    assert!(matches!(
        err,
        Error::CapacityExceeded { occupied: 50_000, capacity: 50_000, requested: 1 }
    ));
}

#[tokio::test]
async fn delete_frees_the_slot() {
    let engine = Arc::new(Engine::new(test_wal_path("scenario_c.wal")).unwrap());
    let w = writer(&engine);
    let u = user(&engine, "c@example.com").await;
    let t = table(&engine, 1, 4).await;
    let big = w.create_booking(booking(u, t, 19, 3)).await.unwrap();
    w.create_booking(booking(u, t, 19, 1)).await.unwrap();
    assert!(w.create_booking(booking(u, t, 19, 1)).await.is_err());

    assert!(w.delete_booking(big).await.unwrap());
    w.create_booking(booking(u, t, 19, 3)).await.unwrap();
    assert_eq!(slot_total(&engine, t, 19).await, 4);
}

#[tokio::test]
async fn delete_missing_booking_returns_false() {
    let engine = Arc::new(Engine::new(test_wal_path("delete_missing.wal")).unwrap());
    assert!(!writer(&engine).delete_booking(12345).await.unwrap());
}

#[tokio::test]
async fn unknown_table_is_not_found_and_writes_nothing() {
    let engine = Arc::new(Engine::new(test_wal_path("scenario_d.wal")).unwrap());
    let w = writer(&engine);
    let u = user(&engine, "d@example.com").await;

    let err = w.create_booking(booking(u, 999, 19, 2)).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(Entity::Table(999))));
    assert!(engine.list_bookings().await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_user_is_a_constraint_violation() {
    let engine = Arc::new(Engine::new(test_wal_path("unknown_user.wal")).unwrap());
    let w = writer(&engine);
    let t = table(&engine, 1, 4).await;

    let err = w.create_booking(booking(77, t, 19, 2)).await.unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));
    assert!(engine.list_bookings().await.unwrap().is_empty());
}

#[tokio::test]
async fn empty_update_is_a_no_op() {
    let engine = Arc::new(Engine::new(test_wal_path("empty_update.wal")).unwrap());
    let w = writer(&engine);
    let u = user(&engine, "noop@example.com").await;
    let t = table(&engine, 1, 4).await;
    let id = w.create_booking(booking(u, t, 19, 2)).await.unwrap();
    let before = engine.list_bookings().await.unwrap();
    let appends = engine.wal_appends_since_compact().await;

    assert!(!w.update_booking(id, BookingPatch::default()).await.unwrap());
    assert_eq!(engine.list_bookings().await.unwrap(), before);
    assert_eq!(engine.wal_appends_since_compact().await, appends);
}

#[tokio::test]
async fn update_missing_booking_is_not_found() {
    let engine = Arc::new(Engine::new(test_wal_path("update_missing.wal")).unwrap());
    let patch = BookingPatch { guests_count: Some(2), ..Default::default() };
    let err = writer(&engine).update_booking(5, patch).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(Entity::Booking(5))));
}

#[tokio::test]
async fn moving_a_booking_checks_the_target_slot() {
    let engine = Arc::new(Engine::new(test_wal_path("move_booking.wal")).unwrap());
    let w = writer(&engine);
    let u = user(&engine, "move@example.com").await;
    let small = table(&engine, 1, 2).await;
    let large = table(&engine, 2, 6).await;
    let id = w.create_booking(booking(u, large, 19, 3)).await.unwrap();

    let to_small = BookingPatch { table_id: Some(small), ..Default::default() };
    let err = w.update_booking(id, to_small).await.unwrap_err();
    assert!(matches!(
        err,
        Error::CapacityExceeded { occupied: 0, capacity: 2, requested: 3 }
    ));

    let to_small_fewer = BookingPatch {
        table_id: Some(small),
        guests_count: Some(2),
        ..Default::default()
    };
    assert!(w.update_booking(id, to_small_fewer).await.unwrap());
    assert_eq!(slot_total(&engine, large, 19).await, 0);
    assert_eq!(slot_total(&engine, small, 19).await, 2);
    assert_eq!(engine.find_booking(id).await.unwrap().unwrap().table_id, small);
}

#[tokio::test]
async fn staged_writes_vanish_on_rollback() {
    let engine = Arc::new(Engine::new(test_wal_path("rollback.wal")).unwrap());
    let u = user(&engine, "rb@example.com").await;
    let t = table(&engine, 1, 4).await;

    let mut unit = engine.begin().await.unwrap();
    unit.insert_booking(&booking(u, t, 19, 2)).await.unwrap();
    unit.rollback().await.unwrap();
    assert!(engine.list_bookings().await.unwrap().is_empty());

    let mut unit = engine.begin().await.unwrap();
    let id = unit.insert_booking(&booking(u, t, 19, 2)).await.unwrap();
    drop(unit);
    assert!(engine.find_booking(id).await.unwrap().is_none());
}

#[tokio::test]
async fn abandoned_commit_still_lands() {
    let path = test_wal_path("abandoned_commit.wal");
    let engine = Arc::new(Engine::new(path.clone()).unwrap());
    let w = writer(&engine);
    let u = user(&engine, "gone@example.com").await;
    let t = table(&engine, 1, 4).await;

    // Stop polling while the commit waits on the WAL.
    assert!(w.create_booking(booking(u, t, 19, 3)).now_or_never().is_none());

    let err = w.create_booking(booking(u, t, 19, 4)).await.unwrap_err();
    assert!(matches!(
        err,
        Error::CapacityExceeded { occupied: 3, capacity: 4, requested: 4 }
    ));
    assert_eq!(slot_total(&engine, t, 19).await, 3);

    drop(w);
    drop(engine);
    let engine = Arc::new(Engine::new(path).unwrap());
    assert_eq!(slot_total(&engine, t, 19).await, 3);
    assert_eq!(engine.list_bookings().await.unwrap().len(), 1);
}

#[tokio::test]
async fn abandoned_directory_change_still_lands() {
    let path = test_wal_path("abandoned_directory.wal");
    let engine = Arc::new(Engine::new(path.clone()).unwrap());
    let u = user(&engine, "cascade@example.com").await;
    let t = table(&engine, 1, 4).await;
    writer(&engine).create_booking(booking(u, t, 19, 2)).await.unwrap();

    let new_table = NewTable { table_number: 2, capacity: 6 };
    assert!(engine.create_table(new_table).now_or_never().is_none());
    assert!(engine.delete_user(u).now_or_never().is_none());

    let mut settled = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let tables = engine.list_tables().await.unwrap();
        let users = engine.list_users().await.unwrap();
        let bookings = engine.list_bookings().await.unwrap();
        if tables.len() == 2 && users.is_empty() && bookings.is_empty() {
            settled = true;
            break;
        }
    }
    assert!(settled, "abandoned changes were not applied");

    drop(engine);
    let engine = Arc::new(Engine::new(path).unwrap());
    assert_eq!(engine.list_tables().await.unwrap().len(), 2);
    assert!(engine.list_users().await.unwrap().is_empty());
    assert!(engine.list_bookings().await.unwrap().is_empty());
}

#[tokio::test]
async fn out_of_order_lock_fails_fast() {
    let engine = Arc::new(Engine::new(test_wal_path("lock_order.wal")).unwrap());
    let low = table(&engine, 1, 4).await;
    let high = table(&engine, 2, 4).await;

    let mut holder = engine.begin().await.unwrap();
    holder.get_table_capacity(low).await.unwrap();

    let mut other = engine.begin().await.unwrap();
    other.get_table_capacity(high).await.unwrap();
    let err = other.get_table_capacity(low).await.unwrap_err();
    assert!(matches!(err, Error::ConflictRetryable));
}

// ── Directory ────────────────────────────────────────────

#[tokio::test]
async fn duplicate_email_and_table_number_rejected() {
    let engine = Arc::new(Engine::new(test_wal_path("uniques.wal")).unwrap());
    user(&engine, "dup@example.com").await;
    let err = engine
        .create_user(NewUser {
            email: "dup@example.com".into(),
            first_name: "B".into(),
            last_name: "C".into(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));

    table(&engine, 5, 4).await;
    let err = engine
        .create_table(NewTable { table_number: 5, capacity: 2 })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));
}

#[tokio::test]
async fn update_user_fields() {
    let engine = Arc::new(Engine::new(test_wal_path("update_user.wal")).unwrap());
    let id = user(&engine, "old@example.com").await;
    let other = user(&engine, "taken@example.com").await;

    let patch = UserPatch { email: Some("new@example.com".into()), ..Default::default() };
    assert!(engine.update_user(id, patch).await.unwrap());
    let u = engine.get_user(id).await.unwrap().unwrap();
    assert_eq!(u.email, "new@example.com");
    assert_eq!(u.first_name, "Ann");

    // Old email is free again, taken one is not.
    user(&engine, "old@example.com").await;
    let patch = UserPatch { email: Some("taken@example.com".into()), ..Default::default() };
    assert!(engine.update_user(id, patch).await.is_err());

    assert!(!engine.update_user(other, UserPatch::default()).await.unwrap());
    let patch = UserPatch { last_name: Some("X".into()), ..Default::default() };
    assert!(!engine.update_user(9999, patch).await.unwrap());
}

#[tokio::test]
async fn lowering_capacity_below_bookings_rejected() {
    let engine = Arc::new(Engine::new(test_wal_path("lower_capacity.wal")).unwrap());
    let w = writer(&engine);
    let u = user(&engine, "cap@example.com").await;
    let t = table(&engine, 1, 6).await;
    w.create_booking(booking(u, t, 19, 5)).await.unwrap();
    w.create_booking(booking(u, t, 20, 2)).await.unwrap();

    let err = engine
        .update_table(t, TablePatch { capacity: Some(4), ..Default::default() })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::CapacityExceeded { occupied: 5, capacity: 4, requested: 0 }
    ));

    assert!(engine
        .update_table(t, TablePatch { capacity: Some(5), ..Default::default() })
        .await
        .unwrap());
    assert_eq!(engine.get_table(t).await.unwrap().unwrap().capacity, 5);
}

#[tokio::test]
async fn deleting_user_cascades_to_bookings() {
    let engine = Arc::new(Engine::new(test_wal_path("cascade_user.wal")).unwrap());
    let w = writer(&engine);
    let gone = user(&engine, "gone@example.com").await;
    let stays = user(&engine, "stays@example.com").await;
    let t1 = table(&engine, 1, 4).await;
    let t2 = table(&engine, 2, 4).await;
    w.create_booking(booking(gone, t1, 19, 2)).await.unwrap();
    w.create_booking(booking(gone, t2, 19, 2)).await.unwrap();
    let kept = w.create_booking(booking(stays, t1, 19, 2)).await.unwrap();

    assert!(engine.delete_user(gone).await.unwrap());
    let left = engine.list_bookings().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].id, kept);
    assert!(!engine.delete_user(gone).await.unwrap());

    let err = w.create_booking(booking(gone, t1, 20, 1)).await.unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));
}

#[tokio::test]
async fn deleting_table_cascades_to_bookings() {
    let engine = Arc::new(Engine::new(test_wal_path("cascade_table.wal")).unwrap());
    let w = writer(&engine);
    let u = user(&engine, "t@example.com").await;
    let t = table(&engine, 1, 4).await;
    let id = w.create_booking(booking(u, t, 19, 2)).await.unwrap();

    assert!(engine.delete_table(t).await.unwrap());
    assert!(engine.find_booking(id).await.unwrap().is_none());
    assert!(engine.get_table(t).await.unwrap().is_none());
    let err = w.create_booking(booking(u, t, 19, 1)).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(Entity::Table(_))));

    // The number is free for a new table.
    table(&engine, 1, 2).await;
}

#[tokio::test]
async fn slot_occupancy_reports_each_slot() {
    let engine = Arc::new(Engine::new(test_wal_path("occupancy.wal")).unwrap());
    let w = writer(&engine);
    let u = user(&engine, "occ@example.com").await;
    let t = table(&engine, 1, 4).await;
    w.create_booking(booking(u, t, 19, 1)).await.unwrap();
    w.create_booking(booking(u, t, 19, 2)).await.unwrap();
    w.create_booking(booking(u, t, 21, 4)).await.unwrap();

    let occupancy = engine.slot_occupancy(t).await.unwrap();
    assert_eq!(occupancy.len(), 2);
    assert_eq!(occupancy[0].slot, Slot::new(t, date(), time(19)));
    assert_eq!(occupancy[0].guests, 3);
    assert_eq!(occupancy[1].guests, 4);
    assert!(occupancy.iter().all(|o| o.capacity == 4));
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn state_survives_restart() {
    let path = test_wal_path("restart.wal");
    let (u, t, moved, deleted) = {
        let engine = Arc::new(Engine::new(path.clone()).unwrap());
        let w = writer(&engine);
        let u = user(&engine, "r@example.com").await;
        let t = table(&engine, 1, 4).await;
        let t2 = table(&engine, 2, 4).await;
        let moved = w.create_booking(booking(u, t2, 19, 2)).await.unwrap();
        let deleted = w.create_booking(booking(u, t, 19, 1)).await.unwrap();
        w.update_booking(moved, BookingPatch { table_id: Some(t), ..Default::default() })
            .await
            .unwrap();
        w.delete_booking(deleted).await.unwrap();
        (u, t, moved, deleted)
    };

    let engine = Arc::new(Engine::new(path).unwrap());
    assert_eq!(engine.get_user(u).await.unwrap().unwrap().email, "r@example.com");
    assert_eq!(engine.find_booking(moved).await.unwrap().unwrap().table_id, t);
    assert!(engine.find_booking(deleted).await.unwrap().is_none());
    assert_eq!(slot_total(&engine, t, 19).await, 2);

    // Constraints and id sequences are restored too.
    let err = engine
        .create_table(NewTable { table_number: 1, capacity: 4 })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ConstraintViolation(_)));
    let next = writer(&engine).create_booking(booking(u, t, 20, 1)).await.unwrap();
    assert!(next > deleted);
}

#[tokio::test]
async fn compaction_preserves_state_and_sequences() {
    let path = test_wal_path("compact_engine.wal");
    let (t, last) = {
        let engine = Arc::new(Engine::new(path.clone()).unwrap());
        let w = writer(&engine);
        let u = user(&engine, "cmp@example.com").await;
        let t = table(&engine, 1, 4).await;
        let mut last = 0;
        for _ in 0..10 {
            last = w.create_booking(booking(u, t, 19, 4)).await.unwrap();
            w.delete_booking(last).await.unwrap();
        }
        w.create_booking(booking(u, t, 20, 3)).await.unwrap();
        let doomed = w.create_booking(booking(u, t, 21, 1)).await.unwrap();
        w.delete_booking(doomed).await.unwrap();
        last = last.max(doomed);

        assert!(engine.wal_appends_since_compact().await > 20);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        (t, last)
    };

    let engine = Arc::new(Engine::new(path).unwrap());
    assert_eq!(engine.list_bookings().await.unwrap().len(), 1);
    assert_eq!(slot_total(&engine, t, 20).await, 3);
    let u = engine.list_users().await.unwrap()[0].id;
    let next = writer(&engine).create_booking(booking(u, t, 19, 1)).await.unwrap();
    assert!(next > last, "ids must not be reused after compaction: {next} <= {last}");
}
