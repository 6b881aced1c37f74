//! 5-field cron parser: literals, ranges `a-b`, comma lists, and `*`.
//!
//! The `/` step syntax is deliberately rejected, as are wrap-around ranges.

use crate::expression::{CronExpression, CronField, FieldMask};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronParseError {
    #[error("expected 5 fields (minute hour dom month dow), got {0}")]
    FieldCount(usize),

    #[error("{field}: step syntax '{token}' is not supported")]
    StepNotSupported { field: &'static str, token: String },

    #[error("{field}: invalid value '{token}'")]
    InvalidValue { field: &'static str, token: String },

    #[error("{field}: value {value} out of range {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("{field}: range start {start} > end {end}")]
    InvertedRange {
        field: &'static str,
        start: u32,
        end: u32,
    },
}

const FIELDS: [CronField; 5] = [
    CronField::Minute,
    CronField::Hour,
    CronField::DayOfMonth,
    CronField::Month,
    CronField::DayOfWeek,
];

/// Parse a whitespace-separated 5-field expression.
pub fn parse(text: &str) -> Result<CronExpression, CronParseError> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() != 5 {
        return Err(CronParseError::FieldCount(tokens.len()));
    }

    let mut masks = [FieldMask::empty(); 5];
    for (i, field) in FIELDS.iter().enumerate() {
        masks[i] = parse_field(tokens[i], *field)?;
    }
    Ok(CronExpression::from_masks(text.to_string(), masks))
}

fn parse_field(token: &str, field: CronField) -> Result<FieldMask, CronParseError> {
    let name = field.name();
    if token.contains('/') {
        return Err(CronParseError::StepNotSupported {
            field: name,
            token: token.to_string(),
        });
    }
    if token == "*" {
        return Ok(FieldMask::full(field));
    }

    let mut mask = FieldMask::empty();
    for part in token.split(',') {
        if let Some((start_s, end_s)) = part.split_once('-') {
            let start = parse_value(start_s, field)?;
            let end = parse_value(end_s, field)?;
            check_bounds(start, field)?;
            check_bounds(end, field)?;
            if start > end {
                return Err(CronParseError::InvertedRange {
                    field: name,
                    start,
                    end,
                });
            }
            for v in start..=end {
                mask.set(v);
            }
        } else {
            let v = parse_value(part, field)?;
            check_bounds(v, field)?;
            mask.set(v);
        }
    }

    debug_assert!(!mask.is_empty());
    Ok(mask)
}

fn parse_value(token: &str, field: CronField) -> Result<u32, CronParseError> {
    token
        .parse::<u32>()
        .map_err(|_| CronParseError::InvalidValue {
            field: field.name(),
            token: token.to_string(),
        })
}

fn check_bounds(value: u32, field: CronField) -> Result<(), CronParseError> {
    let (min, max) = field.range();
    if value < min || value > max {
        return Err(CronParseError::OutOfRange {
            field: field.name(),
            value,
            min,
            max,
        });
    }
    Ok(())
}
