use snafu::Snafu;

use crate::message::Status;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Resource not found: {resource}"))]
    NotFound { resource: String },

    #[snafu(display(
        "Internal error{}",
        source.as_ref().map(|e| format!(": {e}")).unwrap_or_default()
    ))]
    InternalServerError {
        #[snafu(source(false))]
        source: Option<eyre::Report>,
    },

    #[snafu(display("Error returned from database"))]
    Sqlx {
        #[snafu(source)]
        source: sqlx::Error,
    },

    #[snafu(display("Error running migrations"))]
    MigrationError {
        #[snafu(source)]
        source: sqlx::migrate::MigrateError,
    },

    #[snafu(display("Failed to serialize or deserialize payload"))]
    Serialization {
        #[snafu(source)]
        source: serde_json::Error,
    },

    #[snafu(display("Failed to decode stored content: {message}"))]
    Decode { message: String },

    #[snafu(display("Missing header {header}"))]
    MissingHeader { header: String },

    #[snafu(display("Invalid header {header}"))]
    InvalidHeader { header: String },

    #[snafu(display("No subscriber registered for {name} in group {group}"))]
    SubscriberNotFound { name: String, group: String },

    #[snafu(display("Illegal status transition {from} -> {to}"))]
    InvalidTransition { from: Status, to: Status },

    #[snafu(display("Delayed publishing is disabled"))]
    DelayedPublishDisabled,

    #[snafu(display("Dispatcher is shut down"))]
    DispatcherClosed,

    #[snafu(display("Transport failure: {message}"))]
    Transport { message: String },

    #[snafu(display("Subscriber failed: {message}"))]
    Handler { message: String },
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self::Sqlx { source }
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(source: sqlx::migrate::MigrateError) -> Self {
        Self::MigrationError { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Serialization { source }
    }
}

impl From<eyre::Report> for Error {
    fn from(e: eyre::Report) -> Self {
        Self::InternalServerError { source: Some(e) }
    }
}

impl Error {
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    pub fn missing_header(header: impl Into<String>) -> Self {
        Self::MissingHeader {
            header: header.into(),
        }
    }

    pub fn invalid_header(header: impl Into<String>) -> Self {
        Self::InvalidHeader {
            header: header.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }

    pub fn subscriber_not_found(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self::SubscriberNotFound {
            name: name.into(),
            group: group.into(),
        }
    }
}
