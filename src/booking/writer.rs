use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tracing::{debug, warn};

use crate::error::Error;
use crate::model::*;
use crate::observability::{BOOKING_OPS_TOTAL, BOOKING_OP_DURATION_SECONDS, CONFLICT_RETRIES_TOTAL};
use crate::store::{EntityStore, UnitOfWork};

use super::capacity::check_capacity;

/// How often a unit that hit a concurrent conflict is re-run from scratch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero behaves like one.
    pub max_attempts: u32,
    /// Sleep before attempt `n + 1` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Duration::from_millis(5),
        }
    }
}

/// Runs booking writes as check-then-write units against an [`EntityStore`].
pub struct BookingWriter<S> {
    store: S,
    retry: RetryPolicy,
}

impl<S: EntityStore> BookingWriter<S> {
    pub fn new(store: S) -> Self {
        Self::with_retry(store, RetryPolicy::default())
    }

    pub fn with_retry(store: S, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Book a table. Fails with `CapacityExceeded` when the slot cannot take
    /// `guests_count` more guests, and with `NotFound` for an unknown table;
    /// in both cases nothing is written.
    pub async fn create_booking(&self, booking: NewBooking) -> Result<BookingId, Error> {
        booking.validate()?;
        self.in_unit("create", move |unit| {
            Box::pin(async move {
                check_capacity(unit, &booking.slot(), booking.guests_count, None).await?;
                unit.insert_booking(&booking).await
            })
        })
        .await
    }

    /// Change some fields of a booking.
    ///
    /// The capacity check runs against the slot the booking ends up in, with
    /// the booking itself left out of the occupancy sum. An empty patch is a
    /// valid no-op: it returns `Ok(false)` without opening a unit, so it does
    /// not report a missing booking either.
    pub async fn update_booking(&self, id: BookingId, patch: BookingPatch) -> Result<bool, Error> {
        if patch.is_empty() {
            debug!(booking_id = id, "empty booking patch, nothing to update");
            return Ok(false);
        }
        patch.validate()?;
        self.in_unit("update", move |unit| {
            Box::pin(async move {
                let current = unit.get_booking(id).await?;
                let next = patch.apply_to(&current);
                check_capacity(unit, &next.slot(), next.guests_count, Some(id)).await?;
                unit.update_booking_fields(id, &patch).await
            })
        })
        .await
    }

    /// Remove a booking. Occupancy only shrinks, so there is nothing to check.
    pub async fn delete_booking(&self, id: BookingId) -> Result<bool, Error> {
        self.in_unit("delete", move |unit| Box::pin(async move { unit.delete_booking(id).await }))
            .await
    }

    /// Run `body` in a fresh unit, commit on success, roll back on failure,
    /// and re-run the whole thing while the store reports a conflict.
    async fn in_unit<T, F>(&self, op: &'static str, mut body: F) -> Result<T, Error>
    where
        T: Send,
        F: for<'u> FnMut(&'u mut S::Unit) -> BoxFuture<'u, Result<T, Error>> + Send,
    {
        let start = Instant::now();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0u32;

        let result = loop {
            attempt += 1;
            let outcome = match self.store.begin().await {
                Ok(mut unit) => match body(&mut unit).await {
                    Ok(value) => unit.commit().await.map(|()| value),
                    Err(e) => {
                        if let Err(rollback_err) = unit.rollback().await {
                            warn!("{op}: rollback failed: {rollback_err}");
                        }
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            };

            match outcome {
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    metrics::counter!(CONFLICT_RETRIES_TOTAL, "op" => op).increment(1);
                    debug!("{op}: conflict on attempt {attempt}/{max_attempts}, retrying");
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                }
                Err(e) if e.is_retryable() => {
                    warn!("{op}: giving up after {attempt} conflicting attempts");
                    break Err(e);
                }
                other => break other,
            }
        };

        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        metrics::counter!(BOOKING_OPS_TOTAL, "op" => op, "status" => status).increment(1);
        metrics::histogram!(BOOKING_OP_DURATION_SECONDS, "op" => op)
            .record(start.elapsed().as_secs_f64());
        debug!(attempts = attempt, status, "{op} finished");
        result
    }
}
