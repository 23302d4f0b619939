use snafu::Snafu;

/// Failures of model mutations and their propagation. The REST layer
/// maps these onto the HTTP codes existing clients expect.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum ModelError {
    #[snafu(display("{} '{}' not found", kind, name))]
    NotFound { kind: &'static str, name: String },
    #[snafu(display("{} '{}' exists", kind, name))]
    Exists { kind: &'static str, name: String },
    #[snafu(display("{}", reason))]
    Invalid { reason: String },
    #[snafu(display("internal error: {}", reason))]
    Internal { reason: String },
    #[snafu(display("unable to configure remote target: {}", reason))]
    Remote { reason: String },
}

impl ModelError {
    pub(crate) fn not_found(kind: &'static str, name: &str) -> Self {
        ModelError::NotFound {
            kind,
            name: name.to_string(),
        }
    }

    pub(crate) fn exists(kind: &'static str, name: &str) -> Self {
        ModelError::Exists {
            kind,
            name: name.to_string(),
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        ModelError::Invalid {
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(_: serde_json::Error) -> Self {
        ModelError::invalid("invalid json syntax")
    }
}
