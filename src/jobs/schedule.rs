use super::types::Schedule;
use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc};
use regex::Regex;
use std::sync::OnceLock;
use tracing::warn;

/// How far Daily scans before giving up; long enough to cross any weekday
/// set plus a two-week gap.
const DAILY_SCAN_DAYS: i64 = 14;
/// Monthly scans two months of days so short months cannot starve day 29-31.
const MONTHLY_SCAN_DAYS: i64 = 60;

const DEFAULT_DAILY_DAYS: [u8; 5] = [1, 2, 3, 4, 5]; // Mon..Fri, 0 = Sunday

fn time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([01]\d|2[0-3]):[0-5]\d$").unwrap())
}

fn parse_hhmm(value: &str) -> Option<NaiveTime> {
    if !time_re().is_match(value.trim()) {
        return None;
    }
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

/// Next instant a schedule must fire strictly after `now`, or None when it
/// never will (elapsed Once, empty day/time sets, unknown kind).
pub fn next_run(schedule: &Schedule, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match schedule {
        Schedule::Once {
            start_date,
            start_time,
        } => {
            let date = start_date.unwrap_or_else(|| now.date_naive());
            let time = parse_hhmm(start_time)?;
            let candidate = date.and_time(time).and_utc();
            (candidate > now).then_some(candidate)
        }
        Schedule::Daily { days, times } => {
            let mut times: Vec<NaiveTime> =
                times.iter().filter_map(|t| parse_hhmm(t)).collect();
            times.sort();
            times.dedup();
            if times.is_empty() {
                return None;
            }
            let days: Vec<u8> = match days {
                Some(days) => days.clone(),
                None => DEFAULT_DAILY_DAYS.to_vec(),
            };
            if days.is_empty() {
                return None;
            }
            for offset in 0..=DAILY_SCAN_DAYS {
                let date = (now + Duration::days(offset)).date_naive();
                let weekday = date.weekday().num_days_from_sunday() as u8;
                if !days.contains(&weekday) {
                    continue;
                }
                for time in &times {
                    let candidate = date.and_time(*time).and_utc();
                    if candidate > now {
                        return Some(candidate);
                    }
                }
            }
            None
        }
        Schedule::Weekly {
            days_of_week,
            every_n_weeks,
            start_time,
        } => {
            if days_of_week.is_empty() {
                return None;
            }
            let time = parse_hhmm(start_time)?;
            let horizon = 7 * i64::from((*every_n_weeks).max(1));
            for offset in 0..=horizon {
                let date = (now + Duration::days(offset)).date_naive();
                let weekday = date.weekday().number_from_monday() as u8;
                if !days_of_week.contains(&weekday) {
                    continue;
                }
                let candidate = date.and_time(time).and_utc();
                if candidate > now {
                    return Some(candidate);
                }
            }
            None
        }
        Schedule::Monthly {
            days_of_month,
            start_time,
        } => {
            if days_of_month.is_empty() {
                return None;
            }
            let time = parse_hhmm(start_time)?;
            for offset in 0..=MONTHLY_SCAN_DAYS {
                let date = (now + Duration::days(offset)).date_naive();
                if !days_of_month.contains(&date.day()) {
                    continue;
                }
                let candidate = date.and_time(time).and_utc();
                if candidate > now {
                    return Some(candidate);
                }
            }
            None
        }
        Schedule::Unknown => {
            warn!("unrecognized schedule kind, job will not be scheduled");
            None
        }
    }
}
