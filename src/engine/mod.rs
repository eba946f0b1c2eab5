mod directory;
mod unit;
#[cfg(test)]
mod tests;

pub use unit::EngineUnit;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use chrono::{NaiveDate, NaiveTime};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::{info, warn};

use crate::error::Error;
use crate::model::*;
use crate::wal::Wal;

pub type SharedTableState = Arc<RwLock<TableState>>;

/// Write guards held by one unit of work, keyed (and therefore ordered) by table id.
pub(crate) type TableGuards = BTreeMap<TableId, OwnedRwLockWriteGuard<TableState>>;

/// A table row plus every booking on it. The lock around it is the lock on
/// all of the table's slot aggregates.
#[derive(Debug, Clone)]
pub struct TableState {
    pub table: Table,
    pub bookings: BTreeMap<BookingId, Booking>,
    /// Set when the table is deleted while a unit still holds its `Arc`.
    pub deleted: bool,
}

impl TableState {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            bookings: BTreeMap::new(),
            deleted: false,
        }
    }

    /// Guests booked at `date`/`time`, leaving out `exclude`.
    pub fn occupancy(&self, date: NaiveDate, time: NaiveTime, exclude: Option<BookingId>) -> i64 {
        self.bookings
            .values()
            .filter(|b| b.booking_date == date && b.booking_time == time && Some(b.id) != exclude)
            .map(|b| i64::from(b.guests_count))
            .sum()
    }

    pub fn slot_totals(&self) -> BTreeMap<(NaiveDate, NaiveTime), i64> {
        let mut totals = BTreeMap::new();
        for b in self.bookings.values() {
            *totals.entry((b.booking_date, b.booking_time)).or_insert(0) += i64::from(b.guests_count);
        }
        totals
    }

    /// Guests in the busiest slot, 0 when the table has no bookings.
    pub fn fullest_slot(&self) -> i64 {
        self.slot_totals().into_values().max().unwrap_or(0)
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(crate) enum WalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it.
/// 3. One flush_sync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => batch.push((events, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                flush_and_respond(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    let size: usize = batch.iter().map(|(events, _)| events.len()).sum();
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(size as f64);
    let flush_start = std::time::Instant::now();

    let mut append_err: Option<io::Error> = None;
    'outer: for (events, _) in batch.iter() {
        for event in events {
            if let Err(e) = wal.append_buffered(event) {
                append_err = Some(e);
                break 'outer;
            }
        }
    }
    // Always flush, even after an append error, so half-buffered bytes
    // don't leak into the next batch.
    let flush_err = wal.flush_sync().err();
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    let result = match append_err.or(flush_err) {
        Some(e) => Err(e),
        None => Ok(()),
    };
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Apply one booking event to tables whose write guards are already held.
fn apply_booking_event(guards: &mut TableGuards, event: &Event, index: &DashMap<BookingId, TableId>) {
    match event {
        Event::BookingCreated { booking } => {
            if let Some(state) = guards.get_mut(&booking.table_id) {
                state.bookings.insert(booking.id, booking.clone());
                index.insert(booking.id, booking.table_id);
            }
        }
        Event::BookingUpdated { booking, previous_table_id } => {
            if let Some(prev) = guards.get_mut(previous_table_id) {
                prev.bookings.remove(&booking.id);
            }
            if let Some(state) = guards.get_mut(&booking.table_id) {
                state.bookings.insert(booking.id, booking.clone());
                index.insert(booking.id, booking.table_id);
            } else {
                index.remove(&booking.id);
            }
        }
        Event::BookingDeleted { id, table_id } => {
            if let Some(state) = guards.get_mut(table_id) {
                state.bookings.remove(id);
            }
            index.remove(id);
        }
        _ => {}
    }
}

/// Tables an event touches, for lock acquisition.
fn booking_event_tables(event: &Event) -> Vec<TableId> {
    match event {
        Event::BookingCreated { booking } => vec![booking.table_id],
        Event::BookingUpdated { booking, previous_table_id } => {
            vec![*previous_table_id, booking.table_id]
        }
        Event::BookingDeleted { table_id, .. } => vec![*table_id],
        _ => Vec::new(),
    }
}

/// The embedded entity store: all rows in memory, every change logged to a
/// WAL before it becomes visible.
pub struct Engine {
    pub(crate) tables: DashMap<TableId, SharedTableState>,
    pub(crate) users: DashMap<UserId, User>,
    /// Reverse lookup: booking id → table id.
    pub(crate) booking_index: DashMap<BookingId, TableId>,
    pub(crate) emails: DashMap<String, UserId>,
    pub(crate) table_numbers: DashMap<i32, TableId>,
    /// Serializes user/table directory mutations (not booking units).
    pub(crate) directory_lock: Mutex<()>,
    next_user_id: AtomicI32,
    next_table_id: AtomicI32,
    next_booking_id: AtomicI32,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl Engine {
    /// Replay the log at `wal_path` and start its writer task. Needs a Tokio runtime.
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            tables: DashMap::new(),
            users: DashMap::new(),
            booking_index: DashMap::new(),
            emails: DashMap::new(),
            table_numbers: DashMap::new(),
            directory_lock: Mutex::new(()),
            next_user_id: AtomicI32::new(1),
            next_table_id: AtomicI32::new(1),
            next_booking_id: AtomicI32::new(1),
            wal_tx,
        };

        for event in &events {
            engine.replay_event(event);
        }
        info!(
            "replayed {} events from {}: {} users, {} tables, {} bookings",
            events.len(),
            wal_path.display(),
            engine.users.len(),
            engine.tables.len(),
            engine.booking_index.len()
        );
        Ok(engine)
    }

    // We're the sole owner of every lock during replay, so try_write always
    // succeeds. Never block here: this may run inside an async context.
    fn replay_event(&self, event: &Event) {
        match event {
            Event::UserCreated { user } | Event::UserUpdated { user } => {
                if let Some(old) = self.users.insert(user.id, user.clone()) {
                    self.emails.remove(&old.email);
                }
                self.emails.insert(user.email.clone(), user.id);
                self.next_user_id.fetch_max(user.id + 1, Ordering::SeqCst);
            }
            Event::UserDeleted { id } => {
                if let Some((_, user)) = self.users.remove(id) {
                    self.emails.remove(&user.email);
                }
                for entry in self.tables.iter() {
                    if let Ok(mut state) = entry.value().try_write() {
                        state.bookings.retain(|bid, b| {
                            let keep = b.user_id != *id;
                            if !keep {
                                self.booking_index.remove(bid);
                            }
                            keep
                        });
                    }
                }
            }
            Event::TableCreated { table } => {
                self.tables
                    .insert(table.id, Arc::new(RwLock::new(TableState::new(table.clone()))));
                self.table_numbers.insert(table.table_number, table.id);
                self.next_table_id.fetch_max(table.id + 1, Ordering::SeqCst);
            }
            Event::TableUpdated { table } => {
                if let Some(state) = self.get_table_state(&table.id)
                    && let Ok(mut guard) = state.try_write()
                {
                    self.table_numbers.remove(&guard.table.table_number);
                    self.table_numbers.insert(table.table_number, table.id);
                    guard.table = table.clone();
                }
            }
            Event::TableDeleted { id } => {
                if let Some((_, state)) = self.tables.remove(id)
                    && let Ok(guard) = state.try_read()
                {
                    self.table_numbers.remove(&guard.table.table_number);
                    for bid in guard.bookings.keys() {
                        self.booking_index.remove(bid);
                    }
                }
            }
            Event::Checkpoint { next_user_id, next_table_id, next_booking_id } => {
                self.next_user_id.fetch_max(*next_user_id, Ordering::SeqCst);
                self.next_table_id.fetch_max(*next_table_id, Ordering::SeqCst);
                self.next_booking_id.fetch_max(*next_booking_id, Ordering::SeqCst);
            }
            booking_event => {
                let mut guards = TableGuards::new();
                for table_id in booking_event_tables(booking_event) {
                    if let Some(state) = self.get_table_state(&table_id)
                        && let Ok(guard) = state.try_write_owned()
                    {
                        guards.insert(table_id, guard);
                    }
                }
                if guards.is_empty() {
                    warn!("replay: skipping {booking_event:?} for a table that no longer exists");
                    return;
                }
                apply_booking_event(&mut guards, booking_event, &self.booking_index);
                if let Event::BookingCreated { booking } | Event::BookingUpdated { booking, .. } =
                    booking_event
                {
                    self.next_booking_id.fetch_max(booking.id + 1, Ordering::SeqCst);
                }
            }
        }
    }

    pub fn get_table_state(&self, id: &TableId) -> Option<SharedTableState> {
        self.tables.get(id).map(|e| e.value().clone())
    }

    pub(crate) fn allocate_user_id(&self) -> UserId {
        self.next_user_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn allocate_table_id(&self) -> TableId {
        self.next_table_id.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn allocate_booking_id(&self) -> BookingId {
        self.next_booking_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Table ids in ascending order, the only order cascades may lock in.
    pub(crate) fn sorted_table_ids(&self) -> Vec<TableId> {
        let mut ids: Vec<TableId> = self.tables.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Durably log `events` as one group-commit batch.
    pub(crate) async fn wal_append(&self, events: Vec<Event>) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { events, response: tx })
            .await
            .map_err(|_| Error::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| Error::Storage("WAL writer dropped response".into()))?
            .map_err(|e| Error::Storage(format!("WAL: {e}")))
    }

    /// Rewrite the WAL with just the events needed to rebuild the current state.
    ///
    /// Holds the directory lock and a read lock on every table until the
    /// snapshot has replaced the log, so no commit can slip in between.
    pub async fn compact_wal(&self) -> Result<(), Error> {
        let _directory = self.directory_lock.lock().await;

        let mut guards = Vec::new();
        for id in self.sorted_table_ids() {
            if let Some(state) = self.get_table_state(&id) {
                guards.push(state.read_owned().await);
            }
        }

        let mut events = vec![Event::Checkpoint {
            next_user_id: self.next_user_id.load(Ordering::SeqCst),
            next_table_id: self.next_table_id.load(Ordering::SeqCst),
            next_booking_id: self.next_booking_id.load(Ordering::SeqCst),
        }];
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        events.extend(users.into_iter().map(|user| Event::UserCreated { user }));
        for guard in guards.iter().filter(|g| !g.deleted) {
            events.push(Event::TableCreated { table: guard.table.clone() });
        }
        for guard in guards.iter().filter(|g| !g.deleted) {
            for booking in guard.bookings.values() {
                events.push(Event::BookingCreated { booking: booking.clone() });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| Error::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| Error::Storage("WAL writer dropped response".into()))?
            .map_err(|e| Error::Storage(format!("WAL compaction: {e}")))?;

        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
