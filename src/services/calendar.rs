use std::collections::BTreeSet;

use chrono::{Datelike, Duration, NaiveDate, Utc, Weekday};
use chrono_tz::Tz;

use crate::config::AppConfig;

/// Working-day rules for the business: weekly rest days, national holidays
/// (fixed and Easter-relative) and any extra closures from configuration.
#[derive(Debug, Clone)]
pub struct BusinessCalendar {
    tz: Tz,
    rest_days: Vec<Weekday>,
    extra_holidays: BTreeSet<NaiveDate>,
}

impl BusinessCalendar {
    pub fn new(tz: Tz, rest_days: Vec<Weekday>, extra_holidays: BTreeSet<NaiveDate>) -> Self {
        Self {
            tz,
            rest_days,
            extra_holidays,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.timezone,
            config.rest_days.clone(),
            config.extra_holidays.clone(),
        )
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Today's date in the business time zone.
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.tz).date_naive()
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.extra_holidays.contains(&date) || national_holidays(date.year()).contains(&date)
    }

    pub fn is_working_day(&self, date: NaiveDate) -> bool {
        !self.rest_days.contains(&date.weekday()) && !self.is_holiday(date)
    }

    /// The next `n` working days strictly after `today`.
    pub fn next_working_days(&self, today: NaiveDate, n: usize) -> Vec<NaiveDate> {
        let mut days = Vec::with_capacity(n);
        let mut date = today;
        // A year of lookahead is more than any rest-day/holiday mix can consume.
        for _ in 0..366 {
            if days.len() >= n {
                break;
            }
            date += Duration::days(1);
            if self.is_working_day(date) {
                days.push(date);
            }
        }
        days
    }
}

/// Gregorian Easter Sunday (anonymous Gregorian / Meeus-Jones-Butcher).
pub fn easter_sunday(year: i32) -> NaiveDate {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32).unwrap_or_default()
}

/// Bolivian national holidays for `year`.
pub fn national_holidays(year: i32) -> BTreeSet<NaiveDate> {
    let fixed = [
        (1, 1),   // Año Nuevo
        (1, 22),  // Estado Plurinacional
        (5, 1),   // Día del Trabajo
        (6, 21),  // Año Nuevo Andino Amazónico
        (8, 6),   // Independencia
        (11, 2),  // Todos Santos
        (12, 25), // Navidad
    ];

    let easter = easter_sunday(year);
    let moveable = [
        easter - Duration::days(48), // Lunes de Carnaval
        easter - Duration::days(47), // Martes de Carnaval
        easter - Duration::days(2),  // Viernes Santo
        easter + Duration::days(60), // Corpus Christi
    ];

    fixed
        .iter()
        .filter_map(|&(m, d)| NaiveDate::from_ymd_opt(year, m, d))
        .chain(moveable)
        .collect()
}

/// "Lun 19/10" style label for day pickers.
pub fn day_label(date: NaiveDate) -> String {
    let weekday = match date.weekday() {
        Weekday::Mon => "Lun",
        Weekday::Tue => "Mar",
        Weekday::Wed => "Mié",
        Weekday::Thu => "Jue",
        Weekday::Fri => "Vie",
        Weekday::Sat => "Sáb",
        Weekday::Sun => "Dom",
    };
    format!("{weekday} {}", date.format("%d/%m"))
}
