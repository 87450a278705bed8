//! Billing plan catalog and billing-cycle arithmetic

use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// Unit of a plan's billing cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Days,
    Months,
    Years,
}

impl IntervalUnit {
    /// Case-insensitive; anything unrecognized bills monthly
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "day" | "days" => IntervalUnit::Days,
            "year" | "years" => IntervalUnit::Years,
            _ => IntervalUnit::Months,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalUnit::Days => "days",
            IntervalUnit::Months => "months",
            IntervalUnit::Years => "years",
        }
    }
}

impl std::fmt::Display for IntervalUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A normalized billing cycle, e.g. "3 months"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingInterval {
    pub count: u32,
    pub unit: IntervalUnit,
}

impl BillingInterval {
    /// Normalize raw catalog values; `frequency` is clamped to at least 1
    pub fn normalize(frequency: i32, frequency_type: &str) -> Self {
        Self {
            count: frequency.max(1).unsigned_abs(),
            unit: IntervalUnit::parse_lenient(frequency_type),
        }
    }

    /// Add this interval to `start` using calendar rules.
    ///
    /// Month and year steps keep the time of day and clamp the day of month to
    /// the target month's length, so Jan 31 + 1 month is the last day of
    /// February rather than a date in March.
    pub fn add_to(&self, start: OffsetDateTime) -> BillingResult<OffsetDateTime> {
        match self.unit {
            IntervalUnit::Days => start
                .checked_add(Duration::days(i64::from(self.count)))
                .ok_or_else(|| self.overflow(start)),
            IntervalUnit::Months => add_months(start, i64::from(self.count)),
            IntervalUnit::Years => add_months(start, i64::from(self.count) * 12),
        }
    }

    fn overflow(&self, start: OffsetDateTime) -> BillingError {
        BillingError::InvalidInput(format!(
            "adding {} {} to {} overflows the calendar",
            self.count, self.unit, start
        ))
    }
}

impl std::fmt::Display for BillingInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.count, self.unit)
    }
}

fn add_months(start: OffsetDateTime, months: i64) -> BillingResult<OffsetDateTime> {
    let date = start.date();
    let index = i64::from(date.year()) * 12 + i64::from(u8::from(date.month())) - 1 + months;
    let overflow = || {
        BillingError::InvalidInput(format!(
            "adding {} months to {} overflows the calendar",
            months, start
        ))
    };

    let year = i32::try_from(index.div_euclid(12)).map_err(|_| overflow())?;
    let month = u8::try_from(index.rem_euclid(12) + 1)
        .ok()
        .and_then(|m| Month::try_from(m).ok())
        .ok_or_else(overflow)?;

    // Clamp to the last valid day of the target month
    let mut day = date.day();
    let target = loop {
        match Date::from_calendar_date(year, month, day) {
            Ok(d) => break d,
            Err(_) if day > 28 => day -= 1,
            Err(_) => return Err(overflow()),
        }
    };

    Ok(start.replace_date(target))
}

/// A plan in the catalog, mirrored to the provider once synced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingPlan {
    pub id: Uuid,
    pub name: String,
    pub price_cents: i64,
    pub currency: String,
    pub frequency: i32,
    /// Stored normalized ("days", "months", "years")
    pub frequency_type: String,
    pub is_active: bool,
    pub external_plan_id: Option<String>,
}

impl BillingPlan {
    pub fn new(
        name: impl Into<String>,
        price_cents: i64,
        currency: impl Into<String>,
        frequency: i32,
        frequency_type: &str,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            price_cents,
            currency: currency.into(),
            frequency: frequency.max(1),
            frequency_type: IntervalUnit::parse_lenient(frequency_type).as_str().to_string(),
            is_active: true,
            external_plan_id: None,
        }
    }

    pub fn interval(&self) -> BillingInterval {
        BillingInterval::normalize(self.frequency, &self.frequency_type)
    }

    pub fn is_synced(&self) -> bool {
        self.external_plan_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_unit_parsing_is_case_insensitive() {
        assert_eq!(IntervalUnit::parse_lenient("Days"), IntervalUnit::Days);
        assert_eq!(IntervalUnit::parse_lenient("day"), IntervalUnit::Days);
        assert_eq!(IntervalUnit::parse_lenient("YEARS"), IntervalUnit::Years);
        assert_eq!(IntervalUnit::parse_lenient("year"), IntervalUnit::Years);
        assert_eq!(IntervalUnit::parse_lenient("Months"), IntervalUnit::Months);
    }

    #[test]
    fn test_unknown_unit_defaults_to_months() {
        assert_eq!(IntervalUnit::parse_lenient("weird"), IntervalUnit::Months);
        assert_eq!(IntervalUnit::parse_lenient(""), IntervalUnit::Months);
    }

    #[test]
    fn test_frequency_clamped_to_one() {
        assert_eq!(BillingInterval::normalize(0, "months").count, 1);
        assert_eq!(BillingInterval::normalize(-4, "days").count, 1);
        assert_eq!(BillingInterval::normalize(6, "days").count, 6);
    }

    #[test]
    fn test_three_months_from_jan_31_ends_apr_30() {
        let interval = BillingInterval::normalize(3, "Months");
        let end = interval.add_to(datetime!(2024-01-31 00:00 UTC)).unwrap();
        assert_eq!(end, datetime!(2024-04-30 00:00 UTC));
    }

    #[test]
    fn test_one_month_from_jan_31_leap_year() {
        let interval = BillingInterval::normalize(1, "months");
        assert_eq!(
            interval.add_to(datetime!(2024-01-31 09:30 UTC)).unwrap(),
            datetime!(2024-02-29 09:30 UTC)
        );
        assert_eq!(
            interval.add_to(datetime!(2023-01-31 09:30 UTC)).unwrap(),
            datetime!(2023-02-28 09:30 UTC)
        );
    }

    #[test]
    fn test_months_cross_year_boundary() {
        let interval = BillingInterval::normalize(2, "months");
        assert_eq!(
            interval.add_to(datetime!(2024-11-15 00:00 UTC)).unwrap(),
            datetime!(2025-01-15 00:00 UTC)
        );
    }

    #[test]
    fn test_weird_unit_adds_months() {
        let interval = BillingInterval::normalize(1, "weird");
        assert_eq!(
            interval.add_to(datetime!(2024-03-10 00:00 UTC)).unwrap(),
            datetime!(2024-04-10 00:00 UTC)
        );
    }

    #[test]
    fn test_years_from_leap_day() {
        let interval = BillingInterval::normalize(1, "years");
        assert_eq!(
            interval.add_to(datetime!(2024-02-29 00:00 UTC)).unwrap(),
            datetime!(2025-02-28 00:00 UTC)
        );
    }

    #[test]
    fn test_days_are_exact() {
        let interval = BillingInterval::normalize(30, "days");
        assert_eq!(
            interval.add_to(datetime!(2024-01-31 00:00 UTC)).unwrap(),
            datetime!(2024-03-01 00:00 UTC)
        );
    }

    #[test]
    fn test_plan_normalizes_frequency_type() {
        let plan = BillingPlan::new("Pro", 4_900, "USD", 0, "Year");
        assert_eq!(plan.frequency, 1);
        assert_eq!(plan.frequency_type, "years");
        assert!(!plan.is_synced());
    }
}
