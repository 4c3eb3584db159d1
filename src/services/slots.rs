use async_trait::async_trait;
use chrono::NaiveDate;

use crate::db::{self, queries, Db};
use crate::models::{BookingRecord, Slot};
use crate::services::calendar::BusinessCalendar;

/// Slot inventory plus the append-only bookings ledger.
///
/// `claim_slot` is the only cross-conversation synchronization point: it must
/// be linearizable per slot, so two claimants racing for the same row see
/// exactly one `true`.
#[async_trait]
pub trait SlotStore: Send + Sync {
    /// The next `n` working days after today, in the business time zone.
    async fn list_next_working_days(&self, n: usize) -> anyhow::Result<Vec<NaiveDate>>;

    async fn list_open_slots(&self, date: NaiveDate) -> anyhow::Result<Vec<Slot>>;

    async fn claim_slot(&self, slot_id: i64, claimant: &str, service: &str)
        -> anyhow::Result<bool>;

    /// Undo a claim that never became a booking.
    async fn release_slot(&self, slot_id: i64, claimant: &str) -> anyhow::Result<bool>;

    /// Record a confirmed booking, but only while `record.address` still holds
    /// the claim on `record.slot_id`; the slot is then booked for good.
    /// `false` means the claim was lost and nothing was written.
    async fn append_booking(&self, record: &BookingRecord) -> anyhow::Result<bool>;

    async fn latest_booking(&self, address: &str) -> anyhow::Result<Option<BookingRecord>>;
}

pub struct SqliteSlotStore {
    db: Db,
    calendar: BusinessCalendar,
}

impl SqliteSlotStore {
    pub fn new(db: Db, calendar: BusinessCalendar) -> Self {
        Self { db, calendar }
    }
}

#[async_trait]
impl SlotStore for SqliteSlotStore {
    async fn list_next_working_days(&self, n: usize) -> anyhow::Result<Vec<NaiveDate>> {
        Ok(self.calendar.next_working_days(self.calendar.today(), n))
    }

    async fn list_open_slots(&self, date: NaiveDate) -> anyhow::Result<Vec<Slot>> {
        let conn = db::lock(&self.db)?;
        queries::list_open_slots(&conn, date)
    }

    async fn claim_slot(
        &self,
        slot_id: i64,
        claimant: &str,
        service: &str,
    ) -> anyhow::Result<bool> {
        let mut conn = db::lock(&self.db)?;
        let claimed = queries::claim_slot(&mut conn, slot_id, claimant, service)?;
        tracing::info!(slot_id, claimant, claimed, "slot claim");
        Ok(claimed)
    }

    async fn release_slot(&self, slot_id: i64, claimant: &str) -> anyhow::Result<bool> {
        let conn = db::lock(&self.db)?;
        let released = queries::release_slot(&conn, slot_id, claimant)?;
        if released {
            tracing::info!(slot_id, claimant, "slot released");
        }
        Ok(released)
    }

    async fn append_booking(&self, record: &BookingRecord) -> anyhow::Result<bool> {
        let mut conn = db::lock(&self.db)?;
        let committed = queries::commit_booking(&mut conn, record)?;
        if committed {
            tracing::info!(slot_id = record.slot_id, booking_id = %record.id, "booking appended");
        } else {
            tracing::warn!(slot_id = record.slot_id, address = %record.address, "claim no longer held, booking refused");
        }
        Ok(committed)
    }

    async fn latest_booking(&self, address: &str) -> anyhow::Result<Option<BookingRecord>> {
        let conn = db::lock(&self.db)?;
        queries::latest_booking_for_address(&conn, address)
    }
}
