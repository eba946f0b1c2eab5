//! The Entity Store contract the booking core is written against.
//!
//! A store hands out units of work. Everything a booking operation reads and
//! writes goes through one unit, and the store guarantees that two units
//! touching the same slot are linearized: the second one observes whatever the
//! first committed, or it fails with [`Error::ConflictRetryable`].

use async_trait::async_trait;

use crate::error::Error;
use crate::model::*;

#[async_trait]
pub trait EntityStore: Send + Sync {
    type Unit: UnitOfWork;

    /// Open an atomic unit of work. No locks are held until the unit reads.
    async fn begin(&self) -> Result<Self::Unit, Error>;
}

/// One atomic, isolated unit. Writes are invisible to others until `commit`.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Capacity of the table, locking its slot aggregates for the rest of the unit.
    async fn get_table_capacity(&mut self, table_id: TableId) -> Result<i32, Error>;

    /// Sum of `guests_count` in the slot, optionally leaving one booking out.
    async fn sum_guests(&mut self, slot: &Slot, exclude: Option<BookingId>) -> Result<i64, Error>;

    async fn insert_booking(&mut self, booking: &NewBooking) -> Result<BookingId, Error>;

    /// Apply `patch` to the booking. Returns whether a row was changed.
    async fn update_booking_fields(
        &mut self,
        id: BookingId,
        patch: &BookingPatch,
    ) -> Result<bool, Error>;

    async fn get_booking(&mut self, id: BookingId) -> Result<Booking, Error>;

    async fn delete_booking(&mut self, id: BookingId) -> Result<bool, Error>;

    async fn commit(self) -> Result<(), Error>;

    async fn rollback(self) -> Result<(), Error>;
}

/// Plain user/table CRUD and read-side listings. None of these write bookings,
/// except for the cascades implied by deleting their owner.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn create_user(&self, user: NewUser) -> Result<UserId, Error>;
    async fn get_user(&self, id: UserId) -> Result<Option<User>, Error>;
    async fn list_users(&self) -> Result<Vec<User>, Error>;
    async fn update_user(&self, id: UserId, patch: UserPatch) -> Result<bool, Error>;
    async fn delete_user(&self, id: UserId) -> Result<bool, Error>;

    async fn create_table(&self, table: NewTable) -> Result<TableId, Error>;
    async fn get_table(&self, id: TableId) -> Result<Option<Table>, Error>;
    async fn list_tables(&self) -> Result<Vec<Table>, Error>;
    async fn update_table(&self, id: TableId, patch: TablePatch) -> Result<bool, Error>;
    async fn delete_table(&self, id: TableId) -> Result<bool, Error>;

    async fn find_booking(&self, id: BookingId) -> Result<Option<Booking>, Error>;
    async fn list_bookings(&self) -> Result<Vec<Booking>, Error>;
    async fn slot_occupancy(&self, table_id: TableId) -> Result<Vec<SlotOccupancy>, Error>;
}
