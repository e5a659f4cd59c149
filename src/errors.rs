use thiserror::Error;

pub type Result<T> = std::result::Result<T, CrmError>;

#[derive(Error, Debug)]
pub enum CrmError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Backend call failed: {0}")]
    Backend(String),

    #[error("Record not found: {0}")]
    NotFound(String),
}

/// Raised by form builders before anything reaches the store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("{field} must be between {min} and {max}")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
    },

    #[error("{0} must be a non-negative number")]
    Negative(&'static str),

    #[error("'{0}' is not a valid email address")]
    InvalidEmail(String),
}

impl From<sqlx::Error> for CrmError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => CrmError::NotFound("row not found".to_string()),
            other => CrmError::Backend(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for CrmError {
    fn from(err: serde_json::Error) -> Self {
        CrmError::Backend(format!("malformed payload: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_messages_name_the_field() {
        let err: CrmError = ValidationError::MissingField("company").into();
        assert_eq!(err.to_string(), "Validation failed: company is required");

        let range = ValidationError::OutOfRange {
            field: "rating",
            min: 1.0,
            max: 5.0,
        };
        assert_eq!(range.to_string(), "rating must be between 1 and 5");
    }

    #[test]
    fn row_not_found_maps_to_not_found() {
        let err: CrmError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, CrmError::NotFound(_)));
    }
}
