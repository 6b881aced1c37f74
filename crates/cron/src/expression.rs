//! Parsed cron expression value — five bitmasks plus the original text.

use chrono::{DateTime, Datelike, Timelike, Utc};

/// The five positional fields of a cron expression.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CronField {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl CronField {
    pub fn name(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::DayOfMonth => "day-of-month",
            Self::Month => "month",
            Self::DayOfWeek => "day-of-week",
        }
    }

    /// Inclusive value range. Day-of-week is 0..=6 with 0 = Sunday.
    pub fn range(self) -> (u32, u32) {
        match self {
            Self::Minute => (0, 59),
            Self::Hour => (0, 23),
            Self::DayOfMonth => (1, 31),
            Self::Month => (1, 12),
            Self::DayOfWeek => (0, 6),
        }
    }
}

/// Set of allowed values for one field, as a bitmask over 0..=63.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FieldMask {
    bits: u64,
}

impl FieldMask {
    pub(crate) fn empty() -> Self {
        Self { bits: 0 }
    }

    /// Mask with every value of `field`'s range set.
    pub fn full(field: CronField) -> Self {
        let (min, max) = field.range();
        let mut mask = Self::empty();
        for v in min..=max {
            mask.set(v);
        }
        mask
    }

    pub(crate) fn set(&mut self, value: u32) {
        self.bits |= 1 << value;
    }

    pub fn contains(self, value: u32) -> bool {
        value < 64 && self.bits & (1 << value) != 0
    }

    pub fn is_empty(self) -> bool {
        self.bits == 0
    }

    pub fn bits(self) -> u64 {
        self.bits
    }
}

/// Identity of a parsed expression: the five masks, independent of the
/// textual spelling (`"0-1 * * * *"` and `"0,1 * * * *"` are the same).
pub type Fingerprint = [u64; 5];

/// An immutable, validated 5-field cron expression.
///
/// Matching is UTC-only and minute-resolution. Construction goes through
/// [`CronExpression::parse`]; every mask is guaranteed non-empty.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CronExpression {
    text: String,
    minutes: FieldMask,
    hours: FieldMask,
    days_of_month: FieldMask,
    months: FieldMask,
    days_of_week: FieldMask,
}

impl CronExpression {
    pub fn parse(text: &str) -> Result<Self, crate::parse::CronParseError> {
        crate::parse::parse(text)
    }

    pub(crate) fn from_masks(text: String, masks: [FieldMask; 5]) -> Self {
        let [minutes, hours, days_of_month, months, days_of_week] = masks;
        Self {
            text,
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
        }
    }

    /// The original textual form, as given to the parser.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn mask(&self, field: CronField) -> FieldMask {
        match field {
            CronField::Minute => self.minutes,
            CronField::Hour => self.hours,
            CronField::DayOfMonth => self.days_of_month,
            CronField::Month => self.months,
            CronField::DayOfWeek => self.days_of_week,
        }
    }

    /// True iff every value in the field's range is allowed (the field was
    /// `*` or an equivalent spelling).
    pub fn is_unrestricted(&self, field: CronField) -> bool {
        self.mask(field) == FieldMask::full(field)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        [
            self.minutes.bits(),
            self.hours.bits(),
            self.days_of_month.bits(),
            self.months.bits(),
            self.days_of_week.bits(),
        ]
    }

    /// Whether the instant's day satisfies the expression.
    ///
    /// POSIX rule: when both day-of-month and day-of-week are restricted,
    /// either one matching is enough; otherwise the restricted field (if
    /// any) filters alone.
    pub fn day_matches(&self, at: &DateTime<Utc>) -> bool {
        let dom = self.days_of_month.contains(at.day());
        let dow = self
            .days_of_week
            .contains(at.weekday().num_days_from_sunday());
        let dom_restricted = !self.is_unrestricted(CronField::DayOfMonth);
        let dow_restricted = !self.is_unrestricted(CronField::DayOfWeek);
        if dom_restricted && dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Whether the UTC minute containing `at` matches all five fields.
    pub fn matches(&self, at: &DateTime<Utc>) -> bool {
        self.minutes.contains(at.minute())
            && self.hours.contains(at.hour())
            && self.months.contains(at.month())
            && self.day_matches(at)
    }
}

impl std::str::FromStr for CronExpression {
    type Err = crate::parse::CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for CronExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}
