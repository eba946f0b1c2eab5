use crate::error::Error;
use crate::model::*;
use crate::store::UnitOfWork;

/// Reject when `occupied + requested` would exceed `capacity`.
pub fn check_fits(occupied: i64, capacity: i32, requested: i32) -> Result<(), Error> {
    if occupied + i64::from(requested) > i64::from(capacity) {
        return Err(Error::CapacityExceeded {
            occupied,
            capacity,
            requested,
        });
    }
    Ok(())
}

/// Check that `requested` more guests fit in `slot`.
///
/// Reads the table capacity first so the store locks the table before the
/// occupancy sum is taken; both reads happen inside `unit`, which must also
/// carry the write that depends on the outcome. `exclude` leaves one booking
/// out of the sum, so an update does not count its own previous guests.
pub async fn check_capacity<U>(
    unit: &mut U,
    slot: &Slot,
    requested: i32,
    exclude: Option<BookingId>,
) -> Result<(), Error>
where
    U: UnitOfWork + ?Sized,
{
    let capacity = unit.get_table_capacity(slot.table_id).await?;
    let occupied = unit.sum_guests(slot, exclude).await?;
    if let Err(e) = check_fits(occupied, capacity, requested) {
        metrics::counter!(crate::observability::CAPACITY_REJECTIONS_TOTAL).increment(1);
        tracing::warn!(
            table_id = slot.table_id,
            date = %slot.date,
            time = %slot.time,
            occupied,
            capacity,
            requested,
            "booking rejected: slot full"
        );
        return Err(e);
    }
    Ok(())
}
