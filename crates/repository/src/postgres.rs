//! PostgreSQL implementation of [`BookingStore`] on a deadpool connection pool.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use deadpool_postgres::{Object, Pool};
use model::{
    Booking, BookingStatus, CancelBooking, CanceledBy, NewBooking, NewPayment, Payment,
    PaymentStatus, PaymentStatusUpdate, TimeSlot,
};
use tokio_postgres::Row;
use tracing::warn;
use uuid::Uuid;

use crate::{BookingStore, BookingTx, RepositoryError};

const BOOKING_COLUMNS: &str = r#"
    id, user_id, field_id, booking_date, start_time, end_time, total_price, status,
    expires_at, canceled_at, canceled_by, created_at, updated_at, deleted_at
"#;

const PAYMENT_COLUMNS: &str = r#"
    id, booking_id, payment_method, payment_status, transaction_id, paid_at, created_at, updated_at
"#;

/// SET clause of a gateway status update: $2 status, $3 method, $4 paid_at, $5 now.
/// A paid payment keeps its status and method when an unpaid status is reported.
const PAYMENT_UPDATE_SET: &str = r#"
    SET payment_status = CASE
            WHEN payment_status IN ('PAID', 'SETTLED') AND $2::text NOT IN ('PAID', 'SETTLED')
            THEN payment_status ELSE $2::text END,
        payment_method = CASE
            WHEN payment_status IN ('PAID', 'SETTLED') AND $2::text NOT IN ('PAID', 'SETTLED')
            THEN payment_method ELSE $3 END,
        paid_at = COALESCE($4, paid_at),
        updated_at = $5
"#;

fn booking_from_row(row: &Row) -> Result<Booking, RepositoryError> {
    Ok(Booking {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        field_id: row.try_get("field_id")?,
        booking_date: row.try_get("booking_date")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        total_price: row.try_get("total_price")?,
        status: row.try_get("status")?,
        expires_at: row.try_get("expires_at")?,
        canceled_at: row.try_get("canceled_at")?,
        canceled_by: row.try_get("canceled_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn payment_from_row(row: &Row) -> Result<Payment, RepositoryError> {
    let status: String = row.try_get("payment_status")?;
    Ok(Payment {
        id: row.try_get("id")?,
        booking_id: row.try_get("booking_id")?,
        payment_method: row.try_get("payment_method")?,
        payment_status: PaymentStatus::from_gateway(&status),
        transaction_id: row.try_get("transaction_id")?,
        paid_at: row.try_get("paid_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// PostgreSQL implementation of the BookingStore trait.
///
/// Each call checks a connection out of the pool; transactions keep theirs until they end.
#[derive(Clone)]
pub struct PgBookingStore {
    pool: Pool,
}

impl PgBookingStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BookingStore for PgBookingStore {
    async fn begin(&self) -> Result<Box<dyn BookingTx>, RepositoryError> {
        let conn = self.pool.get().await?;
        let tx = PgBookingTx::begin(conn).await?;
        Ok(Box::new(tx))
    }

    async fn get_booking_by_id(&self, id: Uuid) -> Result<Booking, RepositoryError> {
        let conn = self.pool.get().await?;
        let query = format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = $1 AND deleted_at IS NULL"
        );
        let row = conn.query_opt(&query, &[&id]).await?;
        match row {
            Some(row) => booking_from_row(&row),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn get_bookings_by_user(
        &self,
        user_id: Uuid,
        status: Option<BookingStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Booking>, RepositoryError> {
        let conn = self.pool.get().await?;
        let query = format!(
            r#"
            SELECT {BOOKING_COLUMNS} FROM bookings
            WHERE user_id = $1 AND deleted_at IS NULL
              AND ($2::booking_status IS NULL OR status = $2)
            ORDER BY booking_date DESC, start_time DESC, created_at DESC
            LIMIT $3 OFFSET $4
            "#
        );
        let rows = conn
            .query(&query, &[&user_id, &status, &limit, &offset])
            .await?;
        rows.iter().map(booking_from_row).collect()
    }

    async fn count_bookings_by_user(
        &self,
        user_id: Uuid,
        status: Option<BookingStatus>,
    ) -> Result<i64, RepositoryError> {
        let conn = self.pool.get().await?;
        let query = r#"
            SELECT COUNT(*) FROM bookings
            WHERE user_id = $1 AND deleted_at IS NULL
              AND ($2::booking_status IS NULL OR status = $2)
        "#;
        let row = conn.query_one(query, &[&user_id, &status]).await?;
        Ok(row.try_get(0)?)
    }

    async fn get_booked_slots(
        &self,
        field_id: Uuid,
        date: NaiveDate,
    ) -> Result<Vec<TimeSlot>, RepositoryError> {
        let conn = self.pool.get().await?;
        let query = r#"
            SELECT start_time, end_time FROM bookings
            WHERE field_id = $1 AND booking_date = $2 AND deleted_at IS NULL
              AND status IN ('PENDING', 'CONFIRMED', 'PAID')
            ORDER BY start_time
        "#;
        let rows = conn.query(query, &[&field_id, &date]).await?;
        let mut slots = Vec::with_capacity(rows.len());
        for row in rows {
            slots.push(TimeSlot {
                start_time: row.try_get("start_time")?,
                end_time: row.try_get("end_time")?,
            });
        }
        Ok(slots)
    }

    async fn cancel_booking(&self, cancel: &CancelBooking) -> Result<u64, RepositoryError> {
        let conn = self.pool.get().await?;
        let status_guard = match cancel.canceled_by {
            CanceledBy::User => "status = 'PENDING'",
            CanceledBy::Admin | CanceledBy::System => "status IN ('PENDING', 'CONFIRMED', 'PAID')",
        };
        let query = format!(
            r#"
            UPDATE bookings
            SET status = 'CANCELLED', canceled_at = $3, canceled_by = $4, updated_at = $3
            WHERE id = $1 AND ($2::uuid IS NULL OR user_id = $2)
              AND deleted_at IS NULL AND {status_guard}
            "#
        );
        let affected = conn
            .execute(
                &query,
                &[
                    &cancel.booking_id,
                    &cancel.user_id,
                    &cancel.now,
                    &cancel.canceled_by,
                ],
            )
            .await?;
        Ok(affected)
    }

    async fn cancel_unsettled(
        &self,
        id: Uuid,
        canceled_by: CanceledBy,
        now: DateTime<Utc>,
    ) -> Result<u64, RepositoryError> {
        let conn = self.pool.get().await?;
        let query = r#"
            UPDATE bookings
            SET status = 'CANCELLED', canceled_at = $2, canceled_by = $3, updated_at = $2
            WHERE id = $1 AND deleted_at IS NULL AND status IN ('PENDING', 'PAID')
        "#;
        Ok(conn.execute(query, &[&id, &now, &canceled_by]).await?)
    }

    async fn expire_old_bookings(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, RepositoryError> {
        let conn = self.pool.get().await?;
        let query = r#"
            UPDATE bookings SET status = 'EXPIRED', updated_at = $1
            WHERE status = 'PENDING' AND expires_at < $1 AND deleted_at IS NULL
            RETURNING id
        "#;
        let rows = conn.query(query, &[&now]).await?;
        rows.iter()
            .map(|row| row.try_get::<_, Uuid>("id").map_err(RepositoryError::from))
            .collect()
    }

    async fn insert_payment(&self, payment: &NewPayment) -> Result<Payment, RepositoryError> {
        let conn = self.pool.get().await?;
        let query = format!(
            r#"
            INSERT INTO payments (
                id, booking_id, payment_method, payment_status, transaction_id,
                paid_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            RETURNING {PAYMENT_COLUMNS}
            "#
        );
        let row = conn
            .query_one(
                &query,
                &[
                    &payment.id,
                    &payment.booking_id,
                    &payment.payment_method,
                    &payment.payment_status.as_str(),
                    &payment.transaction_id,
                    &payment.paid_at,
                    &payment.created_at,
                ],
            )
            .await?;
        payment_from_row(&row)
    }

    async fn get_payments_by_booking(
        &self,
        booking_id: Uuid,
    ) -> Result<Vec<Payment>, RepositoryError> {
        let conn = self.pool.get().await?;
        let query = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE booking_id = $1 ORDER BY created_at DESC"
        );
        let rows = conn.query(&query, &[&booking_id]).await?;
        rows.iter().map(payment_from_row).collect()
    }
}

/// A transaction holding one pooled connection for its whole lifetime.
///
/// Dropping it before `commit` detaches the connection from the pool and closes it,
/// which makes the server roll the transaction back.
pub struct PgBookingTx {
    conn: Option<Object>,
}

impl PgBookingTx {
    async fn begin(conn: Object) -> Result<Self, RepositoryError> {
        // Owned by the guard before BEGIN is sent, so a cancelled begin detaches the
        // connection instead of returning it to the pool mid-transaction.
        let tx = Self { conn: Some(conn) };
        tx.conn()?.batch_execute("BEGIN").await?;
        Ok(tx)
    }

    fn conn(&self) -> Result<&Object, RepositoryError> {
        self.conn.as_ref().ok_or(RepositoryError::Closed)
    }
}

impl Drop for PgBookingTx {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!("Rolling back unfinished booking transaction");
            drop(Object::take(conn));
        }
    }
}

#[async_trait]
impl BookingTx for PgBookingTx {
    async fn lock_slot(&mut self, field_id: Uuid, date: NaiveDate) -> Result<(), RepositoryError> {
        let key = format!("{field_id}:{date}");
        self.conn()?
            .execute("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))", &[&key])
            .await?;
        Ok(())
    }

    async fn count_overlaps(
        &mut self,
        field_id: Uuid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<i64, RepositoryError> {
        let query = r#"
            SELECT COUNT(*) FROM bookings
            WHERE field_id = $1 AND booking_date = $2 AND deleted_at IS NULL
              AND status IN ('PENDING', 'CONFIRMED', 'PAID')
              AND start_time < $4 AND end_time > $3
        "#;
        let row = self
            .conn()?
            .query_one(query, &[&field_id, &date, &start, &end])
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn get_field_price(&mut self, field_id: Uuid) -> Result<i64, RepositoryError> {
        let query = r#"
            SELECT price_per_hour FROM fields
            WHERE id = $1 AND deleted_at IS NULL
            FOR SHARE
        "#;
        let row = self.conn()?.query_opt(query, &[&field_id]).await?;
        match row {
            Some(row) => Ok(row.try_get("price_per_hour")?),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn insert_booking(&mut self, booking: &NewBooking) -> Result<Booking, RepositoryError> {
        let query = format!(
            r#"
            INSERT INTO bookings (
                id, user_id, field_id, booking_date, start_time, end_time,
                total_price, status, expires_at, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            RETURNING {BOOKING_COLUMNS}
            "#
        );
        let row = self
            .conn()?
            .query_one(
                &query,
                &[
                    &booking.id,
                    &booking.user_id,
                    &booking.field_id,
                    &booking.booking_date,
                    &booking.start_time,
                    &booking.end_time,
                    &booking.total_price,
                    &booking.status,
                    &booking.expires_at,
                    &booking.created_at,
                ],
            )
            .await?;
        booking_from_row(&row)
    }

    async fn lock_booking(&mut self, id: Uuid) -> Result<Booking, RepositoryError> {
        let query = format!(
            r#"
            SELECT {BOOKING_COLUMNS} FROM bookings
            WHERE id = $1 AND deleted_at IS NULL
            FOR UPDATE
            "#
        );
        let row = self.conn()?.query_opt(&query, &[&id]).await?;
        match row {
            Some(row) => booking_from_row(&row),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn set_booking_status(
        &mut self,
        id: Uuid,
        status: BookingStatus,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let query = "UPDATE bookings SET status = $2, updated_at = $3 WHERE id = $1";
        let affected = self.conn()?.execute(query, &[&id, &status, &now]).await?;
        if affected == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn update_payment_status(
        &mut self,
        update: &PaymentStatusUpdate,
    ) -> Result<Payment, RepositoryError> {
        let status = update.payment_status.as_str();

        if let Some(transaction_id) = update.transaction_id.as_deref() {
            let query = format!(
                r#"
                UPDATE payments {PAYMENT_UPDATE_SET}
                WHERE transaction_id = $1
                RETURNING {PAYMENT_COLUMNS}
                "#
            );
            let row = self
                .conn()?
                .query_opt(
                    &query,
                    &[
                        &transaction_id,
                        &status,
                        &update.payment_method,
                        &update.paid_at,
                        &update.now,
                    ],
                )
                .await?;
            if let Some(row) = row {
                return payment_from_row(&row);
            }
        }

        let query = format!(
            r#"
            UPDATE payments {PAYMENT_UPDATE_SET}
            WHERE id = (
                SELECT id FROM payments WHERE booking_id = $1
                ORDER BY created_at DESC LIMIT 1
                FOR UPDATE
            )
            RETURNING {PAYMENT_COLUMNS}
            "#
        );
        let row = self
            .conn()?
            .query_opt(
                &query,
                &[
                    &update.booking_id,
                    &status,
                    &update.payment_method,
                    &update.paid_at,
                    &update.now,
                ],
            )
            .await?;
        match row {
            Some(row) => payment_from_row(&row),
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn commit(mut self: Box<Self>) -> Result<(), RepositoryError> {
        let conn = self.conn.take().ok_or(RepositoryError::Closed)?;
        match conn.batch_execute("COMMIT").await {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(Object::take(conn));
                Err(e.into())
            }
        }
    }
}
