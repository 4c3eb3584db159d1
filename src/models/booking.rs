use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of the append-only booking ledger. Written once per confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BookingRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub address: String,
    pub phone: String,
    pub name: String,
    pub email: String,
    pub service: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub slot_id: i64,
    pub status: BookingStatus,
    pub calendar_ref: Option<String>,
}

impl BookingRecord {
    /// Short human-facing reference printed on receipts.
    pub fn code(&self) -> String {
        self.id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(8)
            .collect::<String>()
            .to_uppercase()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "cancelled" => BookingStatus::Cancelled,
            _ => BookingStatus::Confirmed,
        }
    }
}
