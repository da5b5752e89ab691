use thiserror::Error;

/// Failures of the lineage extraction pipeline
#[derive(Debug, Error)]
pub enum LineageError {
    #[error("Log unavailable: {0}")]
    LogUnavailable(String),

    #[error("Log parse error: {0}")]
    LogParse(String),

    #[error("Unsupported task type: {0}")]
    UnsupportedTaskType(i32),

    /// Never escapes the SQL analyzer; it degrades to an UNKNOWN result
    #[error("SQL analysis degraded: {0}")]
    SqlAnalysisDegraded(String),

    #[error("Numeric field error: {field} must be numeric, got {value:?}")]
    NumericField { field: String, value: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Extractor already registered for task type {0}")]
    DuplicateExtractor(i32),

    #[error("Sink error: {0}")]
    Sink(String),
}

impl LineageError {
    pub fn numeric(field: impl Into<String>, value: impl Into<String>) -> Self {
        LineageError::NumericField {
            field: field.into(),
            value: value.into(),
        }
    }
}

impl From<rusqlite::Error> for LineageError {
    fn from(err: rusqlite::Error) -> Self {
        LineageError::Sink(err.to_string())
    }
}

/// Parse a field that must carry a number
pub fn parse_numeric<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, LineageError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| LineageError::numeric(field, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numeric() {
        assert_eq!(parse_numeric::<i64>("curRunDate", " 20170401 ").unwrap(), 20170401);

        let err = parse_numeric::<i64>("curRunDate", "2017-04-01").unwrap_err();
        assert!(matches!(err, LineageError::NumericField { ref field, .. } if field == "curRunDate"));
        assert!(err.to_string().contains("2017-04-01"));
    }
}
