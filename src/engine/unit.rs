use std::collections::btree_map::Entry;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::error::{Entity, Error};
use crate::limits::*;
use crate::model::*;
use crate::store::{EntityStore, UnitOfWork};

use super::{Engine, TableGuards, TableState, apply_booking_event};

#[async_trait]
impl EntityStore for Arc<Engine> {
    type Unit = EngineUnit;

    async fn begin(&self) -> Result<EngineUnit, Error> {
        Ok(EngineUnit {
            engine: self.clone(),
            guards: TableGuards::new(),
            staged: Vec::new(),
        })
    }
}

/// A unit of work on the embedded engine.
///
/// Table write locks are taken as the unit first touches each table and held
/// until it ends. Writes are staged as events and only logged and applied on
/// `commit`, so reads inside the unit see committed state. Dropping the unit
/// without committing discards everything it staged. Once `commit` has
/// started logging, the batch is applied even if its caller goes away.
pub struct EngineUnit {
    engine: Arc<Engine>,
    guards: TableGuards,
    staged: Vec<Event>,
}

impl EngineUnit {
    /// Write-lock `table_id` for the rest of the unit.
    ///
    /// Waits only when `table_id` is above every table already held; any
    /// other contended lock fails fast with `ConflictRetryable`, so two units
    /// can never wait on each other.
    async fn lock_table(&mut self, table_id: TableId) -> Result<&mut TableState, Error> {
        let may_wait = self
            .guards
            .last_key_value()
            .is_none_or(|(&held, _)| table_id > held);

        let guard = match self.guards.entry(table_id) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(slot) => {
                let state = self
                    .engine
                    .get_table_state(&table_id)
                    .ok_or(Error::NotFound(Entity::Table(table_id)))?;
                let guard = if may_wait {
                    state.write_owned().await
                } else {
                    state.try_write_owned().map_err(|_| {
                        debug!(table_id, "table locked out of order, backing off");
                        Error::ConflictRetryable
                    })?
                };
                slot.insert(guard)
            }
        };
        if guard.deleted {
            return Err(Error::NotFound(Entity::Table(table_id)));
        }
        Ok(&mut **guard)
    }

    fn ensure_user(&self, user_id: UserId) -> Result<(), Error> {
        if !self.engine.users.contains_key(&user_id) {
            return Err(Error::ConstraintViolation(format!(
                "booking references missing user {user_id}"
            )));
        }
        Ok(())
    }

    /// Locate and lock the table currently holding booking `id`.
    async fn lock_booking(&mut self, id: BookingId) -> Result<Option<Booking>, Error> {
        let Some(table_id) = self.engine.booking_index.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let found = match self.lock_table(table_id).await {
            Ok(state) => state.bookings.get(&id).cloned(),
            Err(Error::NotFound(Entity::Table(_))) => None,
            Err(e) => return Err(e),
        };
        match found {
            Some(booking) => Ok(Some(booking)),
            // Moved to another table between the index read and the lock.
            None if self
                .engine
                .booking_index
                .get(&id)
                .is_some_and(|t| *t.value() != table_id) =>
            {
                Err(Error::ConflictRetryable)
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl UnitOfWork for EngineUnit {
    async fn get_table_capacity(&mut self, table_id: TableId) -> Result<i32, Error> {
        Ok(self.lock_table(table_id).await?.table.capacity)
    }

    async fn sum_guests(&mut self, slot: &Slot, exclude: Option<BookingId>) -> Result<i64, Error> {
        let state = self.lock_table(slot.table_id).await?;
        Ok(state.occupancy(slot.date, slot.time, exclude))
    }

    async fn insert_booking(&mut self, booking: &NewBooking) -> Result<BookingId, Error> {
        booking.validate()?;
        self.ensure_user(booking.user_id)?;
        let state = self.lock_table(booking.table_id).await?;
        if state.bookings.len() >= MAX_BOOKINGS_PER_TABLE {
            return Err(Error::LimitExceeded("too many bookings on table"));
        }

        let id = self.engine.allocate_booking_id();
        self.staged.push(Event::BookingCreated {
            booking: Booking {
                id,
                user_id: booking.user_id,
                table_id: booking.table_id,
                booking_date: booking.booking_date,
                booking_time: booking.booking_time,
                guests_count: booking.guests_count,
                created_at: Utc::now(),
            },
        });
        Ok(id)
    }

    async fn update_booking_fields(
        &mut self,
        id: BookingId,
        patch: &BookingPatch,
    ) -> Result<bool, Error> {
        if patch.is_empty() {
            return Ok(false);
        }
        patch.validate()?;
        let Some(current) = self.lock_booking(id).await? else {
            return Ok(false);
        };
        let next = patch.apply_to(&current);
        if next.user_id != current.user_id {
            self.ensure_user(next.user_id)?;
        }
        if next.table_id != current.table_id {
            let state = self.lock_table(next.table_id).await?;
            if state.bookings.len() >= MAX_BOOKINGS_PER_TABLE {
                return Err(Error::LimitExceeded("too many bookings on table"));
            }
        }
        self.staged.push(Event::BookingUpdated {
            booking: next,
            previous_table_id: current.table_id,
        });
        Ok(true)
    }

    async fn get_booking(&mut self, id: BookingId) -> Result<Booking, Error> {
        self.lock_booking(id)
            .await?
            .ok_or(Error::NotFound(Entity::Booking(id)))
    }

    async fn delete_booking(&mut self, id: BookingId) -> Result<bool, Error> {
        let Some(current) = self.lock_booking(id).await? else {
            return Ok(false);
        };
        self.staged.push(Event::BookingDeleted {
            id,
            table_id: current.table_id,
        });
        Ok(true)
    }

    async fn commit(self) -> Result<(), Error> {
        if self.staged.is_empty() {
            return Ok(());
        }
        // A user may have been deleted since the write was staged; the
        // cascade sweeps tables only after this unit lets go of them.
        for event in &self.staged {
            if let Event::BookingCreated { booking } | Event::BookingUpdated { booking, .. } = event {
                self.ensure_user(booking.user_id)?;
            }
        }

        // Logging and applying run on their own task, which owns the table
        // guards, so a caller that stops polling cannot separate the two.
        let EngineUnit { engine, mut guards, staged } = self;
        let count = staged.len();
        tokio::spawn(async move {
            engine.wal_append(staged.clone()).await?;
            for event in &staged {
                apply_booking_event(&mut guards, event, &engine.booking_index);
            }
            Ok::<_, Error>(())
        })
        .await
        .map_err(|e| Error::Storage(format!("commit task failed: {e}")))??;
        debug!(events = count, "unit committed");
        Ok(())
    }

    async fn rollback(self) -> Result<(), Error> {
        if !self.staged.is_empty() {
            debug!(events = self.staged.len(), "unit rolled back");
        }
        Ok(())
    }
}
