use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::limits::*;

pub type UserId = i32;
pub type TableId = i32;
pub type BookingId = i32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

/// A restaurant table. `capacity` bounds the guests of every slot on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub id: TableId,
    pub table_number: i32,
    pub capacity: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub user_id: UserId,
    pub table_id: TableId,
    pub booking_date: NaiveDate,
    pub booking_time: NaiveTime,
    pub guests_count: i32,
    pub created_at: DateTime<Utc>,
}

impl Booking {
    pub fn slot(&self) -> Slot {
        Slot {
            table_id: self.table_id,
            date: self.booking_date,
            time: self.booking_time,
        }
    }
}

/// The unit capacity is aggregated over. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Slot {
    pub table_id: TableId,
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl Slot {
    pub fn new(table_id: TableId, date: NaiveDate, time: NaiveTime) -> Self {
        Self { table_id, date, time }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotOccupancy {
    pub slot: Slot,
    pub guests: i64,
    pub capacity: i32,
}

// ── Creation requests ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
}

impl NewUser {
    pub fn validate(&self) -> Result<(), Error> {
        check_email(&self.email)?;
        check_name(&self.first_name)?;
        check_name(&self.last_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewTable {
    pub table_number: i32,
    pub capacity: i32,
}

impl NewTable {
    pub fn validate(&self) -> Result<(), Error> {
        check_capacity_value(self.capacity)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewBooking {
    pub user_id: UserId,
    pub table_id: TableId,
    pub booking_date: NaiveDate,
    pub booking_time: NaiveTime,
    pub guests_count: i32,
}

impl NewBooking {
    pub fn slot(&self) -> Slot {
        Slot::new(self.table_id, self.booking_date, self.booking_time)
    }

    pub fn validate(&self) -> Result<(), Error> {
        check_guests(self.guests_count)
    }
}

// ── Partial updates ──────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserPatch {
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

impl UserPatch {
    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.first_name.is_none() && self.last_name.is_none()
    }

    pub fn validate(&self) -> Result<(), Error> {
        if let Some(email) = &self.email {
            check_email(email)?;
        }
        if let Some(name) = &self.first_name {
            check_name(name)?;
        }
        if let Some(name) = &self.last_name {
            check_name(name)?;
        }
        Ok(())
    }

    pub fn apply_to(&self, user: &User) -> User {
        User {
            id: user.id,
            email: self.email.clone().unwrap_or_else(|| user.email.clone()),
            first_name: self.first_name.clone().unwrap_or_else(|| user.first_name.clone()),
            last_name: self.last_name.clone().unwrap_or_else(|| user.last_name.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TablePatch {
    pub table_number: Option<i32>,
    pub capacity: Option<i32>,
}

impl TablePatch {
    pub fn is_empty(&self) -> bool {
        self.table_number.is_none() && self.capacity.is_none()
    }

    pub fn validate(&self) -> Result<(), Error> {
        match self.capacity {
            Some(capacity) => check_capacity_value(capacity),
            None => Ok(()),
        }
    }

    pub fn apply_to(&self, table: &Table) -> Table {
        Table {
            id: table.id,
            table_number: self.table_number.unwrap_or(table.table_number),
            capacity: self.capacity.unwrap_or(table.capacity),
        }
    }
}

/// Fields to change on a booking. `None` keeps the stored value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub user_id: Option<UserId>,
    pub table_id: Option<TableId>,
    pub booking_date: Option<NaiveDate>,
    pub booking_time: Option<NaiveTime>,
    pub guests_count: Option<i32>,
}

impl BookingPatch {
    pub fn is_empty(&self) -> bool {
        self.user_id.is_none()
            && self.table_id.is_none()
            && self.booking_date.is_none()
            && self.booking_time.is_none()
            && self.guests_count.is_none()
    }

    pub fn validate(&self) -> Result<(), Error> {
        match self.guests_count {
            Some(guests) => check_guests(guests),
            None => Ok(()),
        }
    }

    /// The row as it will look after the patch. `id` and `created_at` never change.
    pub fn apply_to(&self, booking: &Booking) -> Booking {
        Booking {
            id: booking.id,
            user_id: self.user_id.unwrap_or(booking.user_id),
            table_id: self.table_id.unwrap_or(booking.table_id),
            booking_date: self.booking_date.unwrap_or(booking.booking_date),
            booking_time: self.booking_time.unwrap_or(booking.booking_time),
            guests_count: self.guests_count.unwrap_or(booking.guests_count),
            created_at: booking.created_at,
        }
    }
}

fn check_email(email: &str) -> Result<(), Error> {
    if email.is_empty() {
        return Err(Error::ConstraintViolation("email must not be empty".into()));
    }
    if email.chars().count() > MAX_EMAIL_LEN {
        return Err(Error::LimitExceeded("email too long"));
    }
    Ok(())
}

fn check_name(name: &str) -> Result<(), Error> {
    if name.chars().count() > MAX_NAME_LEN {
        return Err(Error::LimitExceeded("name too long"));
    }
    Ok(())
}

fn check_capacity_value(capacity: i32) -> Result<(), Error> {
    if capacity <= 0 {
        return Err(Error::ConstraintViolation(format!(
            "capacity must be positive, got {capacity}"
        )));
    }
    Ok(())
}

fn check_guests(guests: i32) -> Result<(), Error> {
    if guests <= 0 {
        return Err(Error::ConstraintViolation(format!(
            "guests_count must be positive, got {guests}"
        )));
    }
    Ok(())
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserCreated { user: User },
    UserUpdated { user: User },
    UserDeleted { id: UserId },
    TableCreated { table: Table },
    TableUpdated { table: Table },
    TableDeleted { id: TableId },
    BookingCreated { booking: Booking },
    BookingUpdated { booking: Booking, previous_table_id: TableId },
    BookingDeleted { id: BookingId, table_id: TableId },
    /// Written at the head of a compacted log so ids are never handed out twice.
    Checkpoint {
        next_user_id: UserId,
        next_table_id: TableId,
        next_booking_id: BookingId,
    },
}
