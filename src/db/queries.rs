use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;

use crate::models::{BookingRecord, BookingStatus, ConversationState, Slot, SlotRow, SlotStatus};

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M";

fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.naive_utc().format(TS_FORMAT).to_string()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, TS_FORMAT)
        .map(|naive| naive.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

/// Seed sheets carry both "09:00" and "09:00:00".
fn parse_time(s: &str) -> Option<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, TIME_FORMAT)
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .ok()
}

// ── Slots ──

pub fn insert_slot(
    conn: &Connection,
    date: NaiveDate,
    time: NaiveTime,
    service: Option<&str>,
    notes: Option<&str>,
) -> anyhow::Result<i64> {
    conn.execute(
        "INSERT INTO slots (date, time, service, status, notes) VALUES (?1, ?2, ?3, 'open', ?4)",
        params![
            date.format(DATE_FORMAT).to_string(),
            time.format(TIME_FORMAT).to_string(),
            service,
            notes,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Open slots for `date`, earliest first. Rows with an unparseable time are
/// skipped rather than failing the whole listing.
pub fn list_open_slots(conn: &Connection, date: NaiveDate) -> anyhow::Result<Vec<Slot>> {
    let mut stmt = conn.prepare("SELECT id, time, status FROM slots WHERE date = ?1")?;

    let rows = stmt.query_map(params![date.format(DATE_FORMAT).to_string()], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
        ))
    })?;

    let mut slots = vec![];
    for row in rows {
        let (id, time_str, status) = row?;
        if !SlotStatus::parse(status.as_deref()).is_open() {
            continue;
        }
        match parse_time(&time_str) {
            Some(time) => slots.push(Slot::new(id, date, time)),
            None => tracing::warn!(slot_id = id, time = %time_str, "skipping slot with bad time"),
        }
    }
    slots.sort_by_key(|s| (s.time, s.id));
    Ok(slots)
}

/// Compare-and-set on the slot's status inside one immediate transaction.
/// Returns false, writing nothing, when the row is missing or not open.
pub fn claim_slot(
    conn: &mut Connection,
    id: i64,
    claimant: &str,
    service: &str,
) -> anyhow::Result<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let status: Option<Option<String>> = tx
        .query_row("SELECT status FROM slots WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;

    let Some(status) = status else {
        return Ok(false);
    };
    if !SlotStatus::parse(status.as_deref()).is_open() {
        return Ok(false);
    }

    let changed = tx.execute(
        "UPDATE slots SET status = ?2, claimant = ?3, service = ?4, claimed_at = ?5
         WHERE id = ?1 AND status IS ?6",
        params![
            id,
            SlotStatus::Claimed.as_str(),
            claimant,
            service,
            format_ts(&Utc::now()),
            status,
        ],
    )?;
    tx.commit()?;

    Ok(changed == 1)
}

/// Reopen a slot, but only while `claimant` still holds it.
pub fn release_slot(conn: &Connection, id: i64, claimant: &str) -> anyhow::Result<bool> {
    let count = conn.execute(
        "UPDATE slots SET status = 'open', claimant = NULL, claimed_at = NULL
         WHERE id = ?1 AND status = 'claimed' AND claimant = ?2",
        params![id, claimant],
    )?;
    Ok(count > 0)
}

/// Operator override: reopen whatever holds the slot, unless it is booked.
pub fn force_release_slot(conn: &Connection, id: i64) -> anyhow::Result<bool> {
    let count = conn.execute(
        "UPDATE slots SET status = 'open', claimant = NULL, claimed_at = NULL
         WHERE id = ?1 AND (status IS NULL OR status != 'booked')",
        params![id],
    )?;
    Ok(count > 0)
}

pub fn list_slots(conn: &Connection, date: Option<NaiveDate>) -> anyhow::Result<Vec<SlotRow>> {
    let date = date.map(|d| d.format(DATE_FORMAT).to_string());
    let mut stmt = conn.prepare(
        "SELECT id, date, time, service, status, notes, claimant, claimed_at
         FROM slots WHERE ?1 IS NULL OR date = ?1 ORDER BY date ASC, time ASC, id ASC",
    )?;

    let rows = stmt.query_map(params![date], |row| {
        let status: Option<String> = row.get(4)?;
        Ok(SlotRow {
            id: row.get(0)?,
            date: row.get(1)?,
            time: row.get(2)?,
            service: row.get(3)?,
            status: SlotStatus::parse(status.as_deref()).as_str().to_string(),
            notes: row.get(5)?,
            claimant: row.get(6)?,
            claimed_at: row.get(7)?,
        })
    })?;

    let mut slots = vec![];
    for row in rows {
        slots.push(row?);
    }
    Ok(slots)
}

// ── Bookings ──

/// Append `record` only while its address still holds the claim on its slot,
/// and mark the slot booked in the same transaction. `false` means the claim
/// was released or taken over in the meantime and nothing was written.
pub fn commit_booking(conn: &mut Connection, record: &BookingRecord) -> anyhow::Result<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let changed = tx.execute(
        "UPDATE slots SET status = ?3
         WHERE id = ?1 AND status = ?4 AND claimant = ?2",
        params![
            record.slot_id,
            record.address,
            SlotStatus::Booked.as_str(),
            SlotStatus::Claimed.as_str(),
        ],
    )?;
    if changed != 1 {
        return Ok(false);
    }

    insert_booking(&tx, record)?;
    tx.commit()?;
    Ok(true)
}

pub fn insert_booking(conn: &Connection, record: &BookingRecord) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO bookings (id, created_at, address, phone, name, email, service, date, time, status, slot_id, calendar_ref)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            record.id,
            format_ts(&record.created_at),
            record.address,
            record.phone,
            record.name,
            record.email,
            record.service,
            record.date.format(DATE_FORMAT).to_string(),
            record.time.format(TIME_FORMAT).to_string(),
            record.status.as_str(),
            record.slot_id,
            record.calendar_ref,
        ],
    )?;
    Ok(())
}

const BOOKING_COLUMNS: &str =
    "id, created_at, address, phone, name, email, service, date, time, status, slot_id, calendar_ref";

fn parse_booking_row(row: &rusqlite::Row) -> anyhow::Result<BookingRecord> {
    let created_at: String = row.get(1)?;
    let date: String = row.get(7)?;
    let time: String = row.get(8)?;
    let status: String = row.get(9)?;

    Ok(BookingRecord {
        id: row.get(0)?,
        created_at: parse_ts(&created_at),
        address: row.get(2)?,
        phone: row.get(3)?,
        name: row.get(4)?,
        email: row.get(5)?,
        service: row.get(6)?,
        date: NaiveDate::parse_from_str(&date, DATE_FORMAT)?,
        time: parse_time(&time).ok_or_else(|| anyhow::anyhow!("bad booking time: {time}"))?,
        slot_id: row.get(10)?,
        status: BookingStatus::parse(&status),
        calendar_ref: row.get(11)?,
    })
}

pub fn get_booking_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<BookingRecord>> {
    let result = conn.query_row(
        &format!("SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = ?1"),
        params![id],
        |row| Ok(parse_booking_row(row)),
    );

    match result {
        Ok(booking) => Ok(Some(booking?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn latest_booking_for_address(
    conn: &Connection,
    address: &str,
) -> anyhow::Result<Option<BookingRecord>> {
    let result = conn.query_row(
        &format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE address = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT 1"
        ),
        params![address],
        |row| Ok(parse_booking_row(row)),
    );

    match result {
        Ok(booking) => Ok(Some(booking?)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn list_bookings(
    conn: &Connection,
    date: Option<NaiveDate>,
    limit: i64,
) -> anyhow::Result<Vec<BookingRecord>> {
    let date = date.map(|d| d.format(DATE_FORMAT).to_string());
    let mut stmt = conn.prepare(&format!(
        "SELECT {BOOKING_COLUMNS} FROM bookings WHERE ?1 IS NULL OR date = ?1
         ORDER BY created_at DESC, rowid DESC LIMIT ?2"
    ))?;

    let rows = stmt.query_map(params![date, limit], |row| Ok(parse_booking_row(row)))?;

    let mut bookings = vec![];
    for row in rows {
        bookings.push(row??);
    }
    Ok(bookings)
}

// ── Conversations ──

/// A stored stage that no longer deserializes (older build) is treated as no
/// conversation at all, so the user simply starts over.
pub fn get_conversation(
    conn: &Connection,
    address: &str,
) -> anyhow::Result<Option<ConversationState>> {
    let result = conn
        .query_row(
            "SELECT stage, last_updated FROM conversations WHERE address = ?1",
            params![address],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;

    let Some((stage_json, last_updated)) = result else {
        return Ok(None);
    };

    match serde_json::from_str(&stage_json) {
        Ok(stage) => Ok(Some(ConversationState {
            address: address.to_string(),
            stage,
            last_updated: parse_ts(&last_updated),
        })),
        Err(e) => {
            tracing::warn!(address, error = %e, "discarding unreadable conversation stage");
            Ok(None)
        }
    }
}

pub fn save_conversation(conn: &Connection, state: &ConversationState) -> anyhow::Result<()> {
    let stage_json = serde_json::to_string(&state.stage)?;
    conn.execute(
        "INSERT INTO conversations (address, stage, last_updated)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(address) DO UPDATE SET
           stage = excluded.stage,
           last_updated = excluded.last_updated",
        params![state.address, stage_json, format_ts(&state.last_updated)],
    )?;
    Ok(())
}

pub fn delete_conversation(conn: &Connection, address: &str) -> anyhow::Result<bool> {
    let count = conn.execute(
        "DELETE FROM conversations WHERE address = ?1",
        params![address],
    )?;
    Ok(count > 0)
}

pub fn expired_conversations(
    conn: &Connection,
    cutoff: DateTime<Utc>,
) -> anyhow::Result<Vec<ConversationState>> {
    let mut stmt =
        conn.prepare("SELECT address FROM conversations WHERE last_updated < ?1")?;
    let rows = stmt.query_map(params![format_ts(&cutoff)], |row| row.get::<_, String>(0))?;

    let mut addresses = vec![];
    for row in rows {
        addresses.push(row?);
    }

    let mut expired = vec![];
    for address in addresses {
        match get_conversation(conn, &address)? {
            Some(state) => expired.push(state),
            // unreadable stage: nothing to release, just drop the row
            None => {
                delete_conversation(conn, &address)?;
            }
        }
    }
    Ok(expired)
}

// ── Processed Messages ──

/// Records a provider message id. Returns false if it was already seen.
pub fn mark_message_processed(conn: &Connection, message_id: &str) -> anyhow::Result<bool> {
    let count = conn.execute(
        "INSERT OR IGNORE INTO processed_messages (message_id, received_at) VALUES (?1, ?2)",
        params![message_id, format_ts(&Utc::now())],
    )?;
    Ok(count > 0)
}

pub fn prune_processed_messages(conn: &Connection, cutoff: DateTime<Utc>) -> anyhow::Result<usize> {
    let count = conn.execute(
        "DELETE FROM processed_messages WHERE received_at < ?1",
        params![format_ts(&cutoff)],
    )?;
    Ok(count)
}

// ── Stats ──

#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub open_slots: i64,
    pub claimed_slots: i64,
    pub booked_slots: i64,
    pub bookings: i64,
}

pub fn get_store_stats(conn: &Connection) -> anyhow::Result<StoreStats> {
    let count_status = |status: &str| -> rusqlite::Result<i64> {
        conn.query_row(
            "SELECT COUNT(*) FROM slots WHERE status = ?1",
            params![status],
            |row| row.get(0),
        )
    };
    let claimed_slots = count_status(SlotStatus::Claimed.as_str())?;
    let booked_slots = count_status(SlotStatus::Booked.as_str())?;

    let total_slots: i64 = conn.query_row("SELECT COUNT(*) FROM slots", [], |row| row.get(0))?;
    let other_slots: i64 = conn.query_row(
        "SELECT COUNT(*) FROM slots
         WHERE status IS NOT NULL AND TRIM(status) != ''
           AND LOWER(TRIM(status)) NOT IN ('open', 'disponible', 'claimed', 'booked')",
        [],
        |row| row.get(0),
    )?;
    let bookings: i64 = conn.query_row("SELECT COUNT(*) FROM bookings", [], |row| row.get(0))?;

    Ok(StoreStats {
        open_slots: total_slots - claimed_slots - booked_slots - other_slots,
        claimed_slots,
        booked_slots,
        bookings,
    })
}

pub fn count_conversations(conn: &Connection) -> anyhow::Result<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM conversations", [], |row| row.get(0))?;
    Ok(count as usize)
}
