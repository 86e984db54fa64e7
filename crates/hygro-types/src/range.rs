//! Inclusive time ranges for queries.

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::{ParseError, ParseResult};

/// An inclusive `[from, to]` range where either bound may be open.
///
/// An omitted `from` means "earliest", an omitted `to` means "latest".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeRange {
    pub from: Option<OffsetDateTime>,
    pub to: Option<OffsetDateTime>,
}

impl TimeRange {
    /// The unbounded range.
    pub const ALL: TimeRange = TimeRange {
        from: None,
        to: None,
    };

    pub fn new(from: Option<OffsetDateTime>, to: Option<OffsetDateTime>) -> Self {
        Self { from, to }
    }

    /// Range with both bounds set.
    pub fn between(from: OffsetDateTime, to: OffsetDateTime) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    /// Parse optional RFC3339 bounds as received from an API caller.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::InvalidTimestamp`] for malformed input and
    /// [`ParseError::InvertedRange`] when `from` is after `to`.
    ///
    /// ```
    /// use hygro_types::TimeRange;
    ///
    /// let range = TimeRange::parse_rfc3339(Some("2024-01-01T00:00:00Z"), None).unwrap();
    /// assert!(range.from.is_some());
    /// assert!(range.to.is_none());
    ///
    /// assert!(TimeRange::parse_rfc3339(Some("yesterday"), None).is_err());
    /// ```
    pub fn parse_rfc3339(from: Option<&str>, to: Option<&str>) -> ParseResult<Self> {
        let range = Self {
            from: from.map(parse_timestamp).transpose()?,
            to: to.map(parse_timestamp).transpose()?,
        };

        if let (Some(from), Some(to)) = (range.from, range.to)
            && from > to
        {
            return Err(ParseError::InvertedRange {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        Ok(range)
    }

    /// True if `t` lies inside the range, bounds included.
    pub fn contains(&self, t: OffsetDateTime) -> bool {
        self.from.is_none_or(|from| t >= from) && self.to.is_none_or(|to| t <= to)
    }

    /// True if the half-open interval `[start, end)` shares any instant with this range.
    pub fn overlaps(&self, start: OffsetDateTime, end: OffsetDateTime) -> bool {
        self.from.is_none_or(|from| end > from) && self.to.is_none_or(|to| start <= to)
    }
}

fn parse_timestamp(value: &str) -> ParseResult<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339).map_err(|e| ParseError::InvalidTimestamp {
        value: value.to_string(),
        reason: e.to_string(),
    })
}
