use std::fmt;

use thiserror::Error;

/// Why a single announcement record could not be normalized. The record is rejected and
/// the rest of its batch carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("missing required field {field}")]
    MissingField { field: &'static str },

    #[error("unrecognized activity type '{value}'")]
    UnknownActivity { value: String },

    #[error("field {field} holds an unparseable timestamp '{value}'")]
    InvalidTimestamp { field: &'static str, value: String },

    #[error("record is not a well-formed announcement: {reason}")]
    Shape { reason: String },
}

#[derive(Debug, Clone)]
pub struct RejectedRecord {
    pub index: usize,
    pub activity_id: Option<String>,
    pub error: SchemaError,
}

impl RejectedRecord {
    pub fn new(index: usize, activity_id: Option<String>, error: SchemaError) -> Self {
        Self {
            index,
            activity_id,
            error,
        }
    }
}

impl fmt::Display for RejectedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.activity_id {
            Some(id) => write!(f, "record {} ({}): {}", self.index, id, self.error),
            None => write!(f, "record {}: {}", self.index, self.error),
        }
    }
}

#[derive(Debug, Error)]
pub enum ParserError {
    #[error("announcement batch is malformed: {reason}")]
    MalformedBatch { reason: String },

    #[error("station table CSV error: {source}")]
    Csv {
        #[source]
        source: csv::Error,
    },

    #[error("station table invalid: {message}")]
    StationTable { message: String },

    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
}

impl From<csv::Error> for ParserError {
    fn from(source: csv::Error) -> Self {
        ParserError::Csv { source }
    }
}
