use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobwardenError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Already subscribed to {name}")]
    AlreadySubscribed { name: String },

    #[error("No subscription found for {name}")]
    NotSubscribed { name: String },

    #[error("Store error: {message}")]
    Store { message: String },

    #[error("Worker error: {message}")]
    Worker { message: String },

    #[error("Job handler error: {0}")]
    Handler(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl JobwardenError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        JobwardenError::Validation {
            message: message.into(),
        }
    }
}

impl From<toml::de::Error> for JobwardenError {
    fn from(err: toml::de::Error) -> Self {
        JobwardenError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for JobwardenError {
    fn from(err: toml::ser::Error) -> Self {
        JobwardenError::Config(format!("TOML serialization error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let validation = JobwardenError::validation("name is required");
        assert_eq!(validation.to_string(), "Validation error: name is required");

        let already = JobwardenError::AlreadySubscribed {
            name: "email".to_string(),
        };
        assert_eq!(already.to_string(), "Already subscribed to email");

        let missing = JobwardenError::NotSubscribed {
            name: "email".to_string(),
        };
        assert_eq!(missing.to_string(), "No subscription found for email");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_error = serde_json::from_str::<serde_json::Value>("invalid json");
        assert!(json_error.is_err());

        let error: JobwardenError = json_error.unwrap_err().into();
        assert!(matches!(error, JobwardenError::Serialization(_)));
    }

    #[test]
    fn test_error_from_toml() {
        let toml_error = toml::from_str::<toml::Value>("= broken").unwrap_err();
        let error: JobwardenError = toml_error.into();
        assert!(matches!(error, JobwardenError::Config(_)));
        assert!(error.to_string().contains("TOML deserialization error"));
    }
}
