mod unit;

pub use unit::PgUnit;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row};
use tracing::info;

use crate::error::{Entity, Error};
use crate::model::*;
use crate::store::Directory;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id         SERIAL PRIMARY KEY,
    email      VARCHAR(255) NOT NULL UNIQUE,
    first_name VARCHAR(100) NOT NULL,
    last_name  VARCHAR(100) NOT NULL
);
CREATE TABLE IF NOT EXISTS restaurant_tables (
    id           SERIAL PRIMARY KEY,
    table_number INT NOT NULL UNIQUE,
    capacity     INT NOT NULL CHECK (capacity > 0)
);
CREATE TABLE IF NOT EXISTS bookings (
    id           SERIAL PRIMARY KEY,
    user_id      INT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    table_id     INT NOT NULL REFERENCES restaurant_tables(id) ON DELETE CASCADE,
    booking_date DATE NOT NULL,
    booking_time TIME NOT NULL,
    guests_count INT NOT NULL CHECK (guests_count > 0),
    created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
CREATE INDEX IF NOT EXISTS bookings_slot_idx
    ON bookings (table_id, booking_date, booking_time);
";

const SELECT_BOOKING: &str = "SELECT id, user_id, table_id, booking_date, booking_time, guests_count, created_at
     FROM bookings WHERE id = $1";

/// Entity store backed by PostgreSQL. A unit of work is one transaction that
/// row-locks the table it books against.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Build a pool for `url`. No connection is opened until first use.
    pub fn connect(url: &str, pool_size: usize) -> Result<Self, Error> {
        let pg_config = url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| Error::Storage(format!("invalid database url: {e}")))?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| Error::Storage(format!("failed to create database pool: {e}")))?;
        Ok(Self { pool })
    }

    /// Create the schema if it is missing.
    pub async fn migrate(&self) -> Result<(), Error> {
        self.client().await?.batch_execute(SCHEMA).await.map_err(db_error)?;
        info!("database schema ready");
        Ok(())
    }

    async fn client(&self) -> Result<Object, Error> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::Storage(format!("failed to get database connection: {e}")))
    }
}

// ── Error mapping ────────────────────────────────────────

pub(crate) fn db_error(e: tokio_postgres::Error) -> Error {
    classify(e.code(), e.to_string())
}

/// Map a server error code onto the error taxonomy.
fn classify(code: Option<&SqlState>, message: String) -> Error {
    match code {
        Some(c) if *c == SqlState::T_R_SERIALIZATION_FAILURE || *c == SqlState::T_R_DEADLOCK_DETECTED => {
            Error::ConflictRetryable
        }
        Some(c)
            if *c == SqlState::UNIQUE_VIOLATION
                || *c == SqlState::FOREIGN_KEY_VIOLATION
                || *c == SqlState::CHECK_VIOLATION =>
        {
            Error::ConstraintViolation(message)
        }
        _ => Error::Storage(message),
    }
}

// ── Row decoding ─────────────────────────────────────────

fn user_from_row(row: &Row) -> Result<User, Error> {
    Ok(User {
        id: row.try_get("id").map_err(db_error)?,
        email: row.try_get("email").map_err(db_error)?,
        first_name: row.try_get("first_name").map_err(db_error)?,
        last_name: row.try_get("last_name").map_err(db_error)?,
    })
}

fn table_from_row(row: &Row) -> Result<Table, Error> {
    Ok(Table {
        id: row.try_get("id").map_err(db_error)?,
        table_number: row.try_get("table_number").map_err(db_error)?,
        capacity: row.try_get("capacity").map_err(db_error)?,
    })
}

pub(crate) fn booking_from_row(row: &Row) -> Result<Booking, Error> {
    Ok(Booking {
        id: row.try_get("id").map_err(db_error)?,
        user_id: row.try_get("user_id").map_err(db_error)?,
        table_id: row.try_get("table_id").map_err(db_error)?,
        booking_date: row.try_get("booking_date").map_err(db_error)?,
        booking_time: row.try_get("booking_time").map_err(db_error)?,
        guests_count: row.try_get("guests_count").map_err(db_error)?,
        created_at: row.try_get("created_at").map_err(db_error)?,
    })
}

#[async_trait]
impl Directory for PgStore {
    async fn create_user(&self, user: NewUser) -> Result<UserId, Error> {
        user.validate()?;
        let row = self
            .client()
            .await?
            .query_one(
                "INSERT INTO users (email, first_name, last_name) VALUES ($1, $2, $3) RETURNING id",
                &[&user.email, &user.first_name, &user.last_name],
            )
            .await
            .map_err(db_error)?;
        row.try_get(0).map_err(db_error)
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>, Error> {
        let row = self
            .client()
            .await?
            .query_opt("SELECT id, email, first_name, last_name FROM users WHERE id = $1", &[&id])
            .await
            .map_err(db_error)?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn list_users(&self) -> Result<Vec<User>, Error> {
        let rows = self
            .client()
            .await?
            .query("SELECT id, email, first_name, last_name FROM users ORDER BY id", &[])
            .await
            .map_err(db_error)?;
        rows.iter().map(user_from_row).collect()
    }

    async fn update_user(&self, id: UserId, patch: UserPatch) -> Result<bool, Error> {
        if patch.is_empty() {
            return Ok(false);
        }
        patch.validate()?;
        let changed = self
            .client()
            .await?
            .execute(
                "UPDATE users SET
                    email = COALESCE($2, email),
                    first_name = COALESCE($3, first_name),
                    last_name = COALESCE($4, last_name)
                 WHERE id = $1",
                &[&id, &patch.email, &patch.first_name, &patch.last_name],
            )
            .await
            .map_err(db_error)?;
        Ok(changed > 0)
    }

    async fn delete_user(&self, id: UserId) -> Result<bool, Error> {
        let deleted = self
            .client()
            .await?
            .execute("DELETE FROM users WHERE id = $1", &[&id])
            .await
            .map_err(db_error)?;
        Ok(deleted > 0)
    }

    async fn create_table(&self, table: NewTable) -> Result<TableId, Error> {
        table.validate()?;
        let row = self
            .client()
            .await?
            .query_one(
                "INSERT INTO restaurant_tables (table_number, capacity) VALUES ($1, $2) RETURNING id",
                &[&table.table_number, &table.capacity],
            )
            .await
            .map_err(db_error)?;
        row.try_get(0).map_err(db_error)
    }

    async fn get_table(&self, id: TableId) -> Result<Option<Table>, Error> {
        let row = self
            .client()
            .await?
            .query_opt(
                "SELECT id, table_number, capacity FROM restaurant_tables WHERE id = $1",
                &[&id],
            )
            .await
            .map_err(db_error)?;
        row.as_ref().map(table_from_row).transpose()
    }

    async fn list_tables(&self) -> Result<Vec<Table>, Error> {
        let rows = self
            .client()
            .await?
            .query("SELECT id, table_number, capacity FROM restaurant_tables ORDER BY id", &[])
            .await
            .map_err(db_error)?;
        rows.iter().map(table_from_row).collect()
    }

    async fn update_table(&self, id: TableId, patch: TablePatch) -> Result<bool, Error> {
        if patch.is_empty() {
            return Ok(false);
        }
        patch.validate()?;
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(db_error)?;

        // Same row lock the booking path takes, so no booking lands mid-check.
        let Some(row) = tx
            .query_opt(
                "SELECT id, table_number, capacity FROM restaurant_tables WHERE id = $1 FOR UPDATE",
                &[&id],
            )
            .await
            .map_err(db_error)?
        else {
            return Ok(false);
        };
        let next = patch.apply_to(&table_from_row(&row)?);

        if patch.capacity.is_some() {
            let fullest: i64 = tx
                .query_one(
                    "SELECT COALESCE(MAX(total), 0)::BIGINT FROM (
                        SELECT SUM(guests_count) AS total FROM bookings
                        WHERE table_id = $1
                        GROUP BY booking_date, booking_time
                    ) slots",
                    &[&id],
                )
                .await
                .map_err(db_error)?
                .try_get(0)
                .map_err(db_error)?;
            if fullest > i64::from(next.capacity) {
                return Err(Error::CapacityExceeded {
                    occupied: fullest,
                    capacity: next.capacity,
                    requested: 0,
                });
            }
        }

        tx.execute(
            "UPDATE restaurant_tables SET table_number = $2, capacity = $3 WHERE id = $1",
            &[&id, &next.table_number, &next.capacity],
        )
        .await
        .map_err(db_error)?;
        tx.commit().await.map_err(db_error)?;
        Ok(true)
    }

    async fn delete_table(&self, id: TableId) -> Result<bool, Error> {
        let deleted = self
            .client()
            .await?
            .execute("DELETE FROM restaurant_tables WHERE id = $1", &[&id])
            .await
            .map_err(db_error)?;
        Ok(deleted > 0)
    }

    async fn find_booking(&self, id: BookingId) -> Result<Option<Booking>, Error> {
        let row = self
            .client()
            .await?
            .query_opt(SELECT_BOOKING, &[&id])
            .await
            .map_err(db_error)?;
        row.as_ref().map(booking_from_row).transpose()
    }

    async fn list_bookings(&self) -> Result<Vec<Booking>, Error> {
        let rows = self
            .client()
            .await?
            .query(
                "SELECT id, user_id, table_id, booking_date, booking_time, guests_count, created_at
                 FROM bookings ORDER BY id",
                &[],
            )
            .await
            .map_err(db_error)?;
        rows.iter().map(booking_from_row).collect()
    }

    async fn slot_occupancy(&self, table_id: TableId) -> Result<Vec<SlotOccupancy>, Error> {
        let client = self.client().await?;
        let capacity: i32 = client
            .query_opt("SELECT capacity FROM restaurant_tables WHERE id = $1", &[&table_id])
            .await
            .map_err(db_error)?
            .ok_or(Error::NotFound(Entity::Table(table_id)))?
            .try_get(0)
            .map_err(db_error)?;
        let rows = client
            .query(
                "SELECT booking_date, booking_time, SUM(guests_count)::BIGINT
                 FROM bookings WHERE table_id = $1
                 GROUP BY booking_date, booking_time
                 ORDER BY booking_date, booking_time",
                &[&table_id],
            )
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(|row| -> Result<SlotOccupancy, Error> {
                Ok(SlotOccupancy {
                    slot: Slot::new(
                        table_id,
                        row.try_get(0).map_err(db_error)?,
                        row.try_get(1).map_err(db_error)?,
                    ),
                    guests: row.try_get(2).map_err(db_error)?,
                    capacity,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_failures_are_retryable() {
        let err = classify(Some(&SqlState::T_R_SERIALIZATION_FAILURE), "40001".into());
        assert!(err.is_retryable());
        let err = classify(Some(&SqlState::T_R_DEADLOCK_DETECTED), "40P01".into());
        assert!(err.is_retryable());
    }

    #[test]
    fn integrity_errors_are_constraint_violations() {
        for code in [
            SqlState::UNIQUE_VIOLATION,
            SqlState::FOREIGN_KEY_VIOLATION,
            SqlState::CHECK_VIOLATION,
        ] {
            let err = classify(Some(&code), "duplicate key".into());
            assert!(matches!(err, Error::ConstraintViolation(ref m) if m == "duplicate key"));
        }
    }

    #[test]
    fn everything_else_is_storage() {
        assert!(matches!(
            classify(Some(&SqlState::UNDEFINED_TABLE), "no such table".into()),
            Error::Storage(_)
        ));
        assert!(matches!(classify(None, "connection reset".into()), Error::Storage(_)));
    }

    #[test]
    fn bad_url_rejected() {
        assert!(matches!(
            PgStore::connect("not a url at all ===", 4),
            Err(Error::Storage(_))
        ));
    }
}
