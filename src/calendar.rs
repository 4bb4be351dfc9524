use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, Utc, Weekday};

use crate::model::{HOUR_MS, Ms, Span};

/// Local wall clock and opening hours of the business.
///
/// Every instant in the engine is local wall-clock milliseconds: the local
/// date-time encoded as if it were UTC. Both sites share one fixed offset.
#[derive(Debug, Clone)]
pub struct Calendar {
    offset: FixedOffset,
    open_hour: u32,
    close_hour: u32,
    frozen: Option<NaiveDateTime>,
}

impl Calendar {
    pub fn new(offset: FixedOffset, open_hour: u32, close_hour: u32) -> Self {
        debug_assert!(open_hour < close_hour && close_hour <= 24);
        Self {
            offset,
            open_hour,
            close_hour,
            frozen: None,
        }
    }

    /// Stop the clock at `at` (local time).
    pub fn frozen_at(mut self, at: NaiveDateTime) -> Self {
        self.frozen = Some(at);
        self
    }

    pub fn open_hour(&self) -> u32 {
        self.open_hour
    }

    pub fn close_hour(&self) -> u32 {
        self.close_hour
    }

    pub fn now_local(&self) -> NaiveDateTime {
        self.frozen
            .unwrap_or_else(|| Utc::now().with_timezone(&self.offset).naive_local())
    }

    pub fn today(&self) -> NaiveDate {
        self.now_local().date()
    }

    pub fn now_ms(&self) -> Ms {
        to_ms(self.now_local())
    }

    /// True when `[hour, hour + hours)` fits inside opening hours.
    pub fn within_hours(&self, hour: u32, hours: u32) -> bool {
        hours > 0 && hour >= self.open_hour && hour.checked_add(hours).is_some_and(|end| end <= self.close_hour)
    }

    /// Every start hour of the day, in order.
    pub fn start_hours(&self) -> impl Iterator<Item = u32> {
        self.open_hour..self.close_hour
    }
}

pub fn to_ms(dt: NaiveDateTime) -> Ms {
    dt.and_utc().timestamp_millis()
}

/// Span of `hours` hours starting at `hour` on `date`.
pub fn slot_span(date: NaiveDate, hour: u32, hours: u32) -> Span {
    let start = to_ms(date.and_hms_opt(0, 0, 0).unwrap_or_default()) + hour as Ms * HOUR_MS;
    Span::new(start, start + hours as Ms * HOUR_MS)
}

/// Inverse of [`slot_span`] for the start of a span.
pub fn date_hour(ms: Ms) -> (NaiveDate, u32) {
    let dt = DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_default()
        .naive_utc();
    (dt.date(), chrono::Timelike::hour(&dt))
}

/// Span covering the whole of `date`.
pub fn day_span(date: NaiveDate) -> Span {
    let start = to_ms(date.and_hms_opt(0, 0, 0).unwrap_or_default());
    Span::new(start, start + 24 * HOUR_MS)
}

pub fn days_between(from: NaiveDate, to: NaiveDate) -> i64 {
    (to - from).num_days()
}

pub fn add_days(date: NaiveDate, days: i64) -> NaiveDate {
    date + Duration::days(days)
}

/// Accepts Spanish (`lunes`, `miércoles`, `sabado`), English (`tue`,
/// `Thursday`) and ISO numbers (`1` = Monday … `7` = Sunday).
pub fn parse_weekday(s: &str) -> Option<Weekday> {
    let norm: String = s
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'á' => 'a',
            'é' => 'e',
            'í' => 'i',
            'ó' => 'o',
            'ú' => 'u',
            other => other,
        })
        .collect();
    let wd = match norm.as_str() {
        "lunes" | "1" => Weekday::Mon,
        "martes" | "2" => Weekday::Tue,
        "miercoles" | "3" => Weekday::Wed,
        "jueves" | "4" => Weekday::Thu,
        "viernes" | "5" => Weekday::Fri,
        "sabado" | "6" => Weekday::Sat,
        "domingo" | "7" => Weekday::Sun,
        other => return other.parse().ok(),
    };
    Some(wd)
}

pub fn weekday_name(wd: Weekday) -> &'static str {
    match wd {
        Weekday::Mon => "lunes",
        Weekday::Tue => "martes",
        Weekday::Wed => "miercoles",
        Weekday::Thu => "jueves",
        Weekday::Fri => "viernes",
        Weekday::Sat => "sabado",
        Weekday::Sun => "domingo",
    }
}
