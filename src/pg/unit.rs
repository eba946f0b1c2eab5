use async_trait::async_trait;
use deadpool_postgres::Object;
use tracing::debug;

use crate::error::{Entity, Error};
use crate::model::*;
use crate::store::{EntityStore, UnitOfWork};

use super::{PgStore, SELECT_BOOKING, booking_from_row, db_error};

#[async_trait]
impl EntityStore for PgStore {
    type Unit = PgUnit;

    async fn begin(&self) -> Result<PgUnit, Error> {
        let client = self.client().await?;
        client.batch_execute("BEGIN").await.map_err(db_error)?;
        Ok(PgUnit { client: Some(client) })
    }
}

/// A unit of work on PostgreSQL: one open transaction on a pooled connection.
///
/// Dropped without `commit` or `rollback`, the connection is detached from the
/// pool and closed, which makes the server abort the transaction.
pub struct PgUnit {
    client: Option<Object>,
}

impl PgUnit {
    fn client(&self) -> Result<&Object, Error> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::Storage("unit of work already finished".into()))
    }

    /// Send `statement` and, only if it succeeds, hand the connection back to the pool.
    async fn finish(mut self, statement: &str) -> Result<(), Error> {
        self.client()?.batch_execute(statement).await.map_err(db_error)?;
        self.client.take();
        Ok(())
    }
}

impl Drop for PgUnit {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            debug!("unit dropped mid-transaction, closing its connection");
            drop(Object::take(client));
        }
    }
}

#[async_trait]
impl UnitOfWork for PgUnit {
    async fn get_table_capacity(&mut self, table_id: TableId) -> Result<i32, Error> {
        let row = self
            .client()?
            .query_opt(
                "SELECT capacity FROM restaurant_tables WHERE id = $1 FOR UPDATE",
                &[&table_id],
            )
            .await
            .map_err(db_error)?
            .ok_or(Error::NotFound(Entity::Table(table_id)))?;
        row.try_get(0).map_err(db_error)
    }

    async fn sum_guests(&mut self, slot: &Slot, exclude: Option<BookingId>) -> Result<i64, Error> {
        let row = self
            .client()?
            .query_one(
                "SELECT COALESCE(SUM(guests_count), 0)::BIGINT FROM bookings
                 WHERE table_id = $1 AND booking_date = $2 AND booking_time = $3
                   AND ($4::INT IS NULL OR id <> $4)",
                &[&slot.table_id, &slot.date, &slot.time, &exclude],
            )
            .await
            .map_err(db_error)?;
        row.try_get(0).map_err(db_error)
    }

    async fn insert_booking(&mut self, booking: &NewBooking) -> Result<BookingId, Error> {
        booking.validate()?;
        let row = self
            .client()?
            .query_one(
                "INSERT INTO bookings (user_id, table_id, booking_date, booking_time, guests_count)
                 VALUES ($1, $2, $3, $4, $5) RETURNING id",
                &[
                    &booking.user_id,
                    &booking.table_id,
                    &booking.booking_date,
                    &booking.booking_time,
                    &booking.guests_count,
                ],
            )
            .await
            .map_err(db_error)?;
        row.try_get(0).map_err(db_error)
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
        let changed = self
            .client()?
            .execute(
                "UPDATE bookings SET
                    user_id = COALESCE($2, user_id),
                    table_id = COALESCE($3, table_id),
                    booking_date = COALESCE($4, booking_date),
                    booking_time = COALESCE($5, booking_time),
                    guests_count = COALESCE($6, guests_count)
                 WHERE id = $1",
                &[
                    &id,
                    &patch.user_id,
                    &patch.table_id,
                    &patch.booking_date,
                    &patch.booking_time,
                    &patch.guests_count,
                ],
            )
            .await
            .map_err(db_error)?;
        Ok(changed > 0)
    }

    async fn get_booking(&mut self, id: BookingId) -> Result<Booking, Error> {
        let row = self
            .client()?
            .query_opt(&format!("{SELECT_BOOKING} FOR UPDATE")[..], &[&id])
            .await
            .map_err(db_error)?
            .ok_or(Error::NotFound(Entity::Booking(id)))?;
        booking_from_row(&row)
    }

    async fn delete_booking(&mut self, id: BookingId) -> Result<bool, Error> {
        let deleted = self
            .client()?
            .execute("DELETE FROM bookings WHERE id = $1", &[&id])
            .await
            .map_err(db_error)?;
        Ok(deleted > 0)
    }

    async fn commit(self) -> Result<(), Error> {
        self.finish("COMMIT").await
    }

    async fn rollback(self) -> Result<(), Error> {
        self.finish("ROLLBACK").await
    }
}
