use async_trait::async_trait;
use chrono::{Duration, TimeZone};
use chrono_tz::Tz;

use crate::models::BookingRecord;

/// A durable artifact for a confirmed booking.
#[derive(Debug, Clone)]
pub struct Receipt {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    /// Where the artifact can be fetched publicly, if it is hosted anywhere.
    pub url: Option<String>,
}

#[async_trait]
pub trait ReceiptGenerator: Send + Sync {
    async fn generate(&self, booking: &BookingRecord) -> anyhow::Result<Receipt>;
}

/// Calendar-invite receipts. The file is rendered from the ledger row, so the
/// `/receipts/:id.ics` route can serve it again at any time.
pub struct IcsReceiptGenerator {
    business_name: String,
    timezone: Tz,
    appointment_minutes: i64,
    public_base_url: String,
}

impl IcsReceiptGenerator {
    pub fn new(
        business_name: String,
        timezone: Tz,
        appointment_minutes: i64,
        public_base_url: String,
    ) -> Self {
        Self {
            business_name,
            timezone,
            appointment_minutes,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn render(&self, booking: &BookingRecord) -> anyhow::Result<String> {
        render_ics(
            booking,
            &self.business_name,
            self.timezone,
            self.appointment_minutes,
        )
    }
}

#[async_trait]
impl ReceiptGenerator for IcsReceiptGenerator {
    async fn generate(&self, booking: &BookingRecord) -> anyhow::Result<Receipt> {
        let ics = self.render(booking)?;
        let url = (!self.public_base_url.is_empty())
            .then(|| format!("{}/receipts/{}.ics", self.public_base_url, booking.id));

        Ok(Receipt {
            filename: receipt_filename(booking),
            content_type: "text/calendar; charset=utf-8".to_string(),
            bytes: ics.into_bytes(),
            url,
        })
    }
}

pub fn receipt_filename(booking: &BookingRecord) -> String {
    format!("reserva-{}.ics", booking.code())
}

/// Local appointment time converted to UTC so every calendar client agrees on
/// the instant regardless of its own zone.
pub fn render_ics(
    booking: &BookingRecord,
    business_name: &str,
    tz: Tz,
    minutes: i64,
) -> anyhow::Result<String> {
    let local = booking.date.and_time(booking.time);
    let start = tz
        .from_local_datetime(&local)
        .earliest()
        .ok_or_else(|| anyhow::anyhow!("appointment time {local} does not exist in {tz}"))?;
    let end = start + Duration::minutes(minutes);

    let utc_fmt = "%Y%m%dT%H%M%SZ";
    let dtstart = start.naive_utc().format(utc_fmt).to_string();
    let dtend = end.naive_utc().format(utc_fmt).to_string();
    let dtstamp = booking.created_at.format(utc_fmt).to_string();
    let uid = format!("{}@slotbot", booking.id);

    let summary = escape_text(&format!("{} - {}", booking.service, business_name));
    let mut description = format!(
        "Reserva {}\\nNombre: {}\\nTeléfono: {}",
        booking.code(),
        escape_text(&booking.name),
        escape_text(&booking.phone),
    );
    if !booking.email.is_empty() {
        description.push_str(&format!("\\nCorreo: {}", escape_text(&booking.email)));
    }

    Ok(format!(
        "BEGIN:VCALENDAR\r\n\
         VERSION:2.0\r\n\
         PRODID:-//Slotbot//Reservas//ES\r\n\
         METHOD:PUBLISH\r\n\
         BEGIN:VEVENT\r\n\
         UID:{uid}\r\n\
         DTSTAMP:{dtstamp}\r\n\
         DTSTART:{dtstart}\r\n\
         DTEND:{dtend}\r\n\
         SUMMARY:{summary}\r\n\
         DESCRIPTION:{description}\r\n\
         STATUS:CONFIRMED\r\n\
         END:VEVENT\r\n\
         END:VCALENDAR\r\n"
    ))
}

fn escape_text(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace(';', "\\;")
        .replace(',', "\\,")
        .replace('\n', "\\n")
}
