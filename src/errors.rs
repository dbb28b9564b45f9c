use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Inactive(String),
    Conflict(String),
    PermissionDenied(String),
    Upload(String),
    Internal(String),
}

impl AppError {
    /// Message suitable for direct display. Internal details are not leaked;
    /// every other kind stays distinguishable per error kind.
    pub fn user_message(&self) -> &str {
        match self {
            AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::Inactive(msg)
            | AppError::Conflict(msg)
            | AppError::PermissionDenied(msg)
            | AppError::Upload(msg) => msg.as_str(),
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {msg}");
                "Something went wrong"
            }
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "bad request: {msg}"),
            AppError::NotFound(msg) => write!(f, "not found: {msg}"),
            AppError::Inactive(msg) => write!(f, "inactive: {msg}"),
            AppError::Conflict(msg) => write!(f, "conflict: {msg}"),
            AppError::PermissionDenied(msg) => write!(f, "permission denied: {msg}"),
            AppError::Upload(msg) => write!(f, "upload failed: {msg}"),
            AppError::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<crate::store::StoreError> for AppError {
    fn from(err: crate::store::StoreError) -> Self {
        match err {
            crate::store::StoreError::NotFound(path) => {
                AppError::NotFound(format!("Document {path} does not exist"))
            }
            crate::store::StoreError::TxAborted => {
                AppError::Conflict("Concurrent update lost the transaction race".into())
            }
            crate::store::StoreError::Backend(msg) => AppError::Internal(msg),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
