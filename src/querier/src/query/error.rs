use std::fmt;

use http::StatusCode;

/// The class of failure behind a [`QueryError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The request itself is wrong and must not be retried.
    BadData,
    /// The query is well formed but invalid for the data it ran against.
    Execution,
    /// A collaborator (leaf layer, metric-model service) failed.
    Infrastructure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadData => "bad_data",
            ErrorKind::Execution => "execution",
            ErrorKind::Infrastructure => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by the query engine. Every variant pairs a status code
/// with its message so the outer layer can answer without reclassifying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("{message}")]
    BadData { status: StatusCode, message: String },
    #[error("{message}")]
    Execution { status: StatusCode, message: String },
    #[error("{message}")]
    Infrastructure { status: StatusCode, message: String },
}

impl QueryError {
    /// Bad input answered with 400.
    pub fn bad_data(message: impl Into<String>) -> Self {
        Self::bad_data_with_status(StatusCode::BAD_REQUEST, message)
    }

    pub fn bad_data_with_status(status: StatusCode, message: impl Into<String>) -> Self {
        QueryError::BadData {
            status,
            message: message.into(),
        }
    }

    /// Bad argument values discovered while stepping through a query (422).
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::bad_data_with_status(StatusCode::UNPROCESSABLE_ENTITY, message)
    }

    /// Semantic violation found during evaluation (422).
    pub fn execution(message: impl Into<String>) -> Self {
        QueryError::Execution {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: message.into(),
        }
    }

    pub fn infrastructure(status: StatusCode, message: impl fmt::Display) -> Self {
        QueryError::Infrastructure {
            status,
            message: message.to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            QueryError::BadData { status, .. }
            | QueryError::Execution { status, .. }
            | QueryError::Infrastructure { status, .. } => *status,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::BadData { .. } => ErrorKind::BadData,
            QueryError::Execution { .. } => ErrorKind::Execution,
            QueryError::Infrastructure { .. } => ErrorKind::Infrastructure,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            QueryError::BadData { message, .. }
            | QueryError::Execution { message, .. }
            | QueryError::Infrastructure { message, .. } => message,
        }
    }
}
