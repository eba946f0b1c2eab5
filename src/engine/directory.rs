use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::{Entity, Error};
use crate::limits::*;
use crate::model::*;
use crate::store::Directory;

use super::{Engine, TableState};

impl Engine {
    /// Run a mutation on its own task. A caller that stops waiting cannot
    /// leave a logged change unapplied.
    async fn detached<T, F, Fut>(self: &Arc<Self>, mutation: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Engine>) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        tokio::spawn(mutation(self.clone()))
            .await
            .map_err(|e| Error::Storage(format!("engine task failed: {e}")))?
    }

    /// Remove every booking matching `doomed` from every table, logging each
    /// removal. Tables are locked one at a time, in ascending id order.
    async fn sweep_bookings(&self, doomed: impl Fn(&Booking) -> bool) -> Result<usize, Error> {
        let mut removed = 0;
        for table_id in self.sorted_table_ids() {
            let Some(state) = self.get_table_state(&table_id) else {
                continue;
            };
            let mut guard = state.write().await;
            let ids: Vec<BookingId> = guard
                .bookings
                .values()
                .filter(|b| doomed(b))
                .map(|b| b.id)
                .collect();
            if ids.is_empty() {
                continue;
            }
            let events = ids
                .iter()
                .map(|&id| Event::BookingDeleted { id, table_id })
                .collect();
            self.wal_append(events).await?;
            for id in &ids {
                guard.bookings.remove(id);
                self.booking_index.remove(id);
            }
            removed += ids.len();
        }
        Ok(removed)
    }

    async fn insert_user(&self, user: NewUser) -> Result<UserId, Error> {
        let _directory = self.directory_lock.lock().await;
        if self.users.len() >= MAX_USERS {
            return Err(Error::LimitExceeded("too many users"));
        }
        if self.emails.contains_key(&user.email) {
            return Err(Error::ConstraintViolation(format!(
                "email {} already registered",
                user.email
            )));
        }

        let user = User {
            id: self.allocate_user_id(),
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
        };
        self.wal_append(vec![Event::UserCreated { user: user.clone() }]).await?;
        let id = user.id;
        self.emails.insert(user.email.clone(), id);
        self.users.insert(id, user);
        Ok(id)
    }

    async fn patch_user(&self, id: UserId, patch: UserPatch) -> Result<bool, Error> {
        let _directory = self.directory_lock.lock().await;
        let Some(current) = self.users.get(&id).map(|e| e.value().clone()) else {
            return Ok(false);
        };
        let next = patch.apply_to(&current);
        if next.email != current.email && self.emails.contains_key(&next.email) {
            return Err(Error::ConstraintViolation(format!(
                "email {} already registered",
                next.email
            )));
        }

        self.wal_append(vec![Event::UserUpdated { user: next.clone() }]).await?;
        self.emails.remove(&current.email);
        self.emails.insert(next.email.clone(), id);
        self.users.insert(id, next);
        Ok(true)
    }

    async fn remove_user(&self, id: UserId) -> Result<bool, Error> {
        let _directory = self.directory_lock.lock().await;
        if !self.users.contains_key(&id) {
            return Ok(false);
        }
        self.wal_append(vec![Event::UserDeleted { id }]).await?;
        if let Some((_, user)) = self.users.remove(&id) {
            self.emails.remove(&user.email);
        }
        let removed = self.sweep_bookings(|b| b.user_id == id).await?;
        info!(user_id = id, bookings = removed, "deleted user");
        Ok(true)
    }

    async fn insert_table(&self, table: NewTable) -> Result<TableId, Error> {
        let _directory = self.directory_lock.lock().await;
        if self.tables.len() >= MAX_TABLES {
            return Err(Error::LimitExceeded("too many tables"));
        }
        if self.table_numbers.contains_key(&table.table_number) {
            return Err(Error::ConstraintViolation(format!(
                "table number {} already exists",
                table.table_number
            )));
        }

        let table = Table {
            id: self.allocate_table_id(),
            table_number: table.table_number,
            capacity: table.capacity,
        };
        self.wal_append(vec![Event::TableCreated { table: table.clone() }]).await?;
        let id = table.id;
        self.table_numbers.insert(table.table_number, id);
        self.tables.insert(id, Arc::new(RwLock::new(TableState::new(table))));
        Ok(id)
    }

    async fn patch_table(&self, id: TableId, patch: TablePatch) -> Result<bool, Error> {
        let _directory = self.directory_lock.lock().await;
        let Some(state) = self.get_table_state(&id) else {
            return Ok(false);
        };
        let mut guard = state.write().await;
        let current = guard.table.clone();
        let next = patch.apply_to(&current);

        if next.table_number != current.table_number
            && self.table_numbers.contains_key(&next.table_number)
        {
            return Err(Error::ConstraintViolation(format!(
                "table number {} already exists",
                next.table_number
            )));
        }
        let fullest = guard.fullest_slot();
        if fullest > i64::from(next.capacity) {
            return Err(Error::CapacityExceeded {
                occupied: fullest,
                capacity: next.capacity,
                requested: 0,
            });
        }

        self.wal_append(vec![Event::TableUpdated { table: next.clone() }]).await?;
        self.table_numbers.remove(&current.table_number);
        self.table_numbers.insert(next.table_number, id);
        guard.table = next;
        Ok(true)
    }

    async fn remove_table(&self, id: TableId) -> Result<bool, Error> {
        let _directory = self.directory_lock.lock().await;
        let Some(state) = self.get_table_state(&id) else {
            return Ok(false);
        };
        let mut guard = state.write().await;
        self.wal_append(vec![Event::TableDeleted { id }]).await?;

        guard.deleted = true;
        for booking_id in guard.bookings.keys() {
            self.booking_index.remove(booking_id);
        }
        let removed = guard.bookings.len();
        guard.bookings.clear();
        self.table_numbers.remove(&guard.table.table_number);
        self.tables.remove(&id);
        info!(table_id = id, bookings = removed, "deleted table");
        Ok(true)
    }

    async fn read_table(&self, id: TableId) -> Option<Table> {
        let state = self.get_table_state(&id)?;
        let table = state.read().await.table.clone();
        Some(table)
    }
}

#[async_trait]
impl Directory for Arc<Engine> {
    async fn create_user(&self, user: NewUser) -> Result<UserId, Error> {
        user.validate()?;
        self.detached(|engine| async move { engine.insert_user(user).await })
            .await
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, Error> {
        Ok(self.users.get(&id).map(|e| e.value().clone()))
    }

    async fn list_users(&self) -> Result<Vec<User>, Error> {
        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        Ok(users)
    }

    async fn update_user(&self, id: UserId, patch: UserPatch) -> Result<bool, Error> {
        if patch.is_empty() {
            return Ok(false);
        }
        patch.validate()?;
        self.detached(move |engine| async move { engine.patch_user(id, patch).await })
            .await
    }

    async fn delete_user(&self, id: UserId) -> Result<bool, Error> {
        self.detached(move |engine| async move { engine.remove_user(id).await })
            .await
    }

    async fn create_table(&self, table: NewTable) -> Result<TableId, Error> {
        table.validate()?;
        self.detached(|engine| async move { engine.insert_table(table).await })
            .await
    }

    async fn get_table(&self, id: TableId) -> Result<Option<Table>, Error> {
        Ok(self.read_table(id).await)
    }

    async fn list_tables(&self) -> Result<Vec<Table>, Error> {
        let mut tables = Vec::with_capacity(self.tables.len());
        for id in self.sorted_table_ids() {
            if let Some(table) = self.read_table(id).await {
                tables.push(table);
            }
        }
        Ok(tables)
    }

    /// Lowering `capacity` below the busiest slot is refused with
    /// `CapacityExceeded { requested: 0, .. }`.
    async fn update_table(&self, id: TableId, patch: TablePatch) -> Result<bool, Error> {
        if patch.is_empty() {
            return Ok(false);
        }
        patch.validate()?;
        self.detached(move |engine| async move { engine.patch_table(id, patch).await })
            .await
    }

    async fn delete_table(&self, id: TableId) -> Result<bool, Error> {
        self.detached(move |engine| async move { engine.remove_table(id).await })
            .await
    }

    async fn find_booking(&self, id: BookingId) -> Result<Option<Booking>, Error> {
        let Some(table_id) = self.booking_index.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        match self.get_table_state(&table_id) {
            Some(state) => Ok(state.read().await.bookings.get(&id).cloned()),
            None => Ok(None),
        }
    }

    async fn list_bookings(&self) -> Result<Vec<Booking>, Error> {
        let mut bookings = Vec::with_capacity(self.booking_index.len());
        for table_id in self.sorted_table_ids() {
            if let Some(state) = self.get_table_state(&table_id) {
                bookings.extend(state.read().await.bookings.values().cloned());
            }
        }
        bookings.sort_by_key(|b| b.id);
        Ok(bookings)
    }

    async fn slot_occupancy(&self, table_id: TableId) -> Result<Vec<SlotOccupancy>, Error> {
        let state = self
            .get_table_state(&table_id)
            .ok_or(Error::NotFound(Entity::Table(table_id)))?;
        let guard = state.read().await;
        Ok(guard
            .slot_totals()
            .into_iter()
            .map(|((date, time), guests)| SlotOccupancy {
                slot: Slot::new(table_id, date, time),
                guests,
                capacity: guard.table.capacity,
            })
            .collect())
    }
}
