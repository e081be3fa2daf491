use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, TimeZone, Weekday};

use crate::config::{Frequency, ScheduleConfig, ValidationError, parse_time_of_day};

/// When publish ticks happen, in local wall-clock time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cadence {
    pub frequency: Frequency,
    pub time: NaiveTime,
    pub weekday: Weekday,
    pub day_of_month: u32,
}

/// Longest gap between two fire dates (monthly), with slack
const SEARCH_DAYS: u64 = 62;

impl Cadence {
    pub fn from_config(config: &ScheduleConfig) -> Result<Self, ValidationError> {
        let time = parse_time_of_day(&config.time_of_day).ok_or_else(|| {
            ValidationError::InvalidTimeOfDay {
                value: config.time_of_day.clone(),
            }
        })?;

        if !(1..=28).contains(&config.day_of_month) {
            return Err(ValidationError::InvalidDayOfMonth {
                value: config.day_of_month,
            });
        }

        Ok(Self {
            frequency: config.frequency,
            time,
            weekday: config.weekday,
            day_of_month: config.day_of_month,
        })
    }

    fn fires_on(&self, date: NaiveDate) -> bool {
        match self.frequency {
            Frequency::Daily => true,
            Frequency::Weekly => date.weekday() == self.weekday,
            Frequency::Monthly => date.day() == self.day_of_month,
        }
    }

    /// First fire time strictly after `now`
    ///
    /// A fire time that falls into a DST gap moves to the first valid
    /// instant after it; an ambiguous one uses the earlier instant.
    pub fn next_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> DateTime<Tz> {
        let tz = now.timezone();
        let today = now.date_naive();

        for offset in 0..=SEARCH_DAYS {
            let Some(date) = today.checked_add_days(Days::new(offset)) else {
                break;
            };
            if !self.fires_on(date) {
                continue;
            }

            let local = date.and_time(self.time);
            let candidate = tz
                .from_local_datetime(&local)
                .earliest()
                .or_else(|| {
                    // Inside a DST gap: the hour after is always valid
                    tz.from_local_datetime(&(local + chrono::Duration::hours(1)))
                        .earliest()
                });

            if let Some(candidate) = candidate {
                if candidate > *now {
                    return candidate;
                }
            }
        }

        // Unreachable for validated cadences
        now.clone() + chrono::Duration::days(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn cadence(frequency: Frequency) -> Cadence {
        Cadence {
            frequency,
            time: NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
            weekday: Weekday::Mon,
            day_of_month: 1,
        }
    }

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_daily_later_today_or_tomorrow() {
        let c = cadence(Frequency::Daily);
        assert_eq!(
            c.next_after(&utc("2026-03-10T01:00:00Z")),
            utc("2026-03-10T02:00:00Z")
        );
        assert_eq!(
            c.next_after(&utc("2026-03-10T02:00:00Z")),
            utc("2026-03-11T02:00:00Z")
        );
    }

    #[test]
    fn test_weekly_lands_on_weekday() {
        let c = cadence(Frequency::Weekly);
        // 2026-03-11 is a Wednesday
        let next = c.next_after(&utc("2026-03-11T12:00:00Z"));
        assert_eq!(next, utc("2026-03-16T02:00:00Z"));
        assert_eq!(next.weekday(), Weekday::Mon);
    }

    #[test]
    fn test_monthly_rolls_over_year() {
        let c = Cadence {
            day_of_month: 15,
            ..cadence(Frequency::Monthly)
        };
        assert_eq!(
            c.next_after(&utc("2026-12-20T00:00:00Z")),
            utc("2027-01-15T02:00:00Z")
        );
        assert_eq!(
            c.next_after(&utc("2026-02-15T01:59:00Z")),
            utc("2026-02-15T02:00:00Z")
        );
    }

    #[test]
    fn test_from_config_rejects_bad_time() {
        let config = ScheduleConfig {
            time_of_day: "2am".to_string(),
            ..ScheduleConfig::default()
        };
        assert!(Cadence::from_config(&config).is_err());

        let parsed = Cadence::from_config(&ScheduleConfig::default()).unwrap();
        assert_eq!(parsed, cadence(Frequency::Daily));
    }
}
