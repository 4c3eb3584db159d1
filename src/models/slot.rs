use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// A bookable date+time unit as read from the slot table. Claims refer to `id`,
/// never to a position in a rendered list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Slot {
    pub id: i64,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub label: String,
}

impl Slot {
    pub fn new(id: i64, date: NaiveDate, time: NaiveTime) -> Self {
        Self {
            id,
            date,
            time,
            label: time.format("%H:%M").to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotStatus {
    Open,
    Claimed,
    /// Committed to the bookings ledger; never reopened.
    Booked,
    Other(String),
}

impl SlotStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SlotStatus::Open => "open",
            SlotStatus::Claimed => "claimed",
            SlotStatus::Booked => "booked",
            SlotStatus::Other(s) => s,
        }
    }

    /// A missing or blank status counts as open, as does the legacy
    /// `DISPONIBLE` sentinel found in seed sheets.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => SlotStatus::Open,
            Some(s) if s.eq_ignore_ascii_case("open") || s.eq_ignore_ascii_case("disponible") => {
                SlotStatus::Open
            }
            Some(s) if s.eq_ignore_ascii_case("claimed") => SlotStatus::Claimed,
            Some(s) if s.eq_ignore_ascii_case("booked") => SlotStatus::Booked,
            Some(s) => SlotStatus::Other(s.to_string()),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, SlotStatus::Open)
    }
}

/// Full slot row, including claim bookkeeping. Only the admin API reads these.
#[derive(Debug, Clone, Serialize)]
pub struct SlotRow {
    pub id: i64,
    pub date: String,
    pub time: String,
    pub service: Option<String>,
    pub status: String,
    pub notes: Option<String>,
    pub claimant: Option<String>,
    pub claimed_at: Option<String>,
}
