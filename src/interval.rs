//! Weekly allowed-merge interval.
//!
//! A `WeeklyInterval` is a span `(start-weekday, start-time) ..=
//! (end-weekday, end-time)` that recurs every week, possibly wrapping past
//! the week boundary (e.g. Friday evening through Monday morning).
//! `IntervalUnion` is a set of these; `covers` is true if any member covers
//! the instant. Grounded on `examples/original_source/tests/test_interval.py`
//! (`marge.interval.WeeklyInterval`/`IntervalUnion`).

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Timelike, Utc, Weekday};

/// Minutes since the start of the week (Monday 00:00), the unit `covers`
/// actually compares in.
fn week_minutes(weekday: Weekday, time: NaiveTime) -> i64 {
    let day_index = weekday.num_days_from_monday() as i64;
    day_index * 24 * 60 + time.num_seconds_from_midnight() as i64 / 60
}

const MINUTES_PER_WEEK: i64 = 7 * 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeeklyInterval {
    start_weekday: Weekday,
    start_time: NaiveTime,
    end_weekday: Weekday,
    end_time: NaiveTime,
    /// Fixed UTC offset the weekday/time pair is expressed in. Named IANA
    /// zones are not supported (see DESIGN.md); callers that need a named
    /// zone must resolve its current offset themselves before constructing
    /// this.
    offset: FixedOffset,
}

impl WeeklyInterval {
    pub fn new(
        start_weekday: Weekday,
        start_time: NaiveTime,
        end_weekday: Weekday,
        end_time: NaiveTime,
    ) -> Self {
        Self {
            start_weekday,
            start_time,
            end_weekday,
            end_time,
            offset: FixedOffset::east_opt(0).expect("zero offset is always valid"),
        }
    }

    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    /// True iff `instant` falls within this weekly span, inclusive of both
    /// endpoints. Comparisons happen in the interval's own offset so that a
    /// UTC instant and the "same" instant expressed with an explicit offset
    /// resolve identically (P5).
    pub fn covers(&self, instant: DateTime<Utc>) -> bool {
        let local = instant.with_timezone(&self.offset);
        let now_minutes = week_minutes(local.weekday(), local.time());
        let start = week_minutes(self.start_weekday, self.start_time);
        let end = week_minutes(self.end_weekday, self.end_time);

        if start <= end {
            now_minutes >= start && now_minutes <= end
        } else {
            // Wraps across the week boundary (e.g. Fri..Mon).
            now_minutes >= start || now_minutes <= end
        }
    }

    /// Parse `"Mon@9am - Fri@5pm"` or `"Mon 09:00 +01:00 - Fri 17:00
    /// +01:00"`. The offset suffix is optional per endpoint and defaults to
    /// UTC when omitted.
    pub fn from_human(s: &str) -> anyhow::Result<Self> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| anyhow::anyhow!("expected 'START - END' in interval {s:?}"))?;
        let (start_weekday, start_time, start_offset) = parse_endpoint(start.trim())?;
        let (end_weekday, end_time, end_offset) = parse_endpoint(end.trim())?;
        let offset = start_offset.or(end_offset).unwrap_or(FixedOffset::east_opt(0).unwrap());
        Ok(Self::new(start_weekday, start_time, end_weekday, end_time).with_offset(offset))
    }
}

fn parse_endpoint(s: &str) -> anyhow::Result<(Weekday, NaiveTime, Option<FixedOffset>)> {
    // Accept "@" as a separator between weekday and time, or a bare space.
    let normalized = s.replacen('@', " ", 1);
    let mut parts = normalized.split_whitespace();
    let weekday_str = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("missing weekday in {s:?}"))?;
    let time_str = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("missing time in {s:?}"))?;
    let offset_str = parts.next();

    let weekday = parse_weekday(weekday_str)
        .ok_or_else(|| anyhow::anyhow!("unrecognized weekday {weekday_str:?}"))?;
    let time = parse_time(time_str)?;
    let offset = offset_str.map(parse_offset).transpose()?;

    Ok((weekday, time, offset))
}

fn parse_weekday(s: &str) -> Option<Weekday> {
    let lower = s.to_ascii_lowercase();
    const NAMES: &[(&str, Weekday)] = &[
        ("monday", Weekday::Mon),
        ("mon", Weekday::Mon),
        ("tuesday", Weekday::Tue),
        ("tue", Weekday::Tue),
        ("wednesday", Weekday::Wed),
        ("wed", Weekday::Wed),
        ("thursday", Weekday::Thu),
        ("thu", Weekday::Thu),
        ("friday", Weekday::Fri),
        ("fri", Weekday::Fri),
        ("saturday", Weekday::Sat),
        ("sat", Weekday::Sat),
        ("sunday", Weekday::Sun),
        ("sun", Weekday::Sun),
    ];
    NAMES
        .iter()
        .find(|(name, _)| *name == lower)
        .map(|(_, day)| *day)
}

fn parse_time(s: &str) -> anyhow::Result<NaiveTime> {
    let lower = s.to_ascii_lowercase();
    if let Some(digits) = lower.strip_suffix("am").or_else(|| lower.strip_suffix("pm")) {
        let is_pm = lower.ends_with("pm");
        let (hour_str, minute) = match digits.split_once(':') {
            Some((h, m)) => (h, m.parse::<u32>()?),
            None => (digits, 0),
        };
        let mut hour = hour_str.parse::<u32>()?;
        if is_pm && hour != 12 {
            hour += 12;
        }
        if !is_pm && hour == 12 {
            hour = 0;
        }
        return NaiveTime::from_hms_opt(hour, minute, 0)
            .ok_or_else(|| anyhow::anyhow!("invalid time {s:?}"));
    }

    let (hour_str, minute_str) = lower
        .split_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected HH:MM or H(am|pm) in {s:?}"))?;
    let hour = hour_str.parse::<u32>()?;
    let minute = minute_str.parse::<u32>()?;
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(|| anyhow::anyhow!("invalid time {s:?}"))
}

fn parse_offset(s: &str) -> anyhow::Result<FixedOffset> {
    let sign = match s.chars().next() {
        Some('+') => 1,
        Some('-') => -1,
        _ => return Err(anyhow::anyhow!("expected +HH:MM or -HH:MM offset, got {s:?}")),
    };
    let rest = &s[1..];
    let (hour_str, minute_str) = rest.split_once(':').unwrap_or((rest, "00"));
    let hour: i32 = hour_str.parse()?;
    let minute: i32 = minute_str.parse()?;
    let total_seconds = sign * (hour * 3600 + minute * 60);
    FixedOffset::east_opt(total_seconds).ok_or_else(|| anyhow::anyhow!("offset out of range: {s:?}"))
}

/// A union of weekly intervals. Empty union covers nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalUnion(Vec<WeeklyInterval>);

impl IntervalUnion {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn new(intervals: Vec<WeeklyInterval>) -> Self {
        Self(intervals)
    }

    /// Unrestricted: covers every instant. Used when no interval is
    /// configured, so the bot is always allowed to act.
    pub fn always() -> Self {
        Self(vec![WeeklyInterval::new(
            Weekday::Mon,
            NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
            Weekday::Sun,
            NaiveTime::from_hms_opt(23, 59, 59).unwrap(),
        )])
    }

    pub fn covers(&self, instant: DateTime<Utc>) -> bool {
        self.0.iter().any(|interval| interval.covers(instant))
    }

    pub fn from_human(s: &str) -> anyhow::Result<Self> {
        if s.trim().is_empty() {
            return Ok(Self::always());
        }
        let intervals = s
            .split(',')
            .map(|part| WeeklyInterval::from_human(part.trim()))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self(intervals))
    }
}
