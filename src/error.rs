//! HTTP-facing errors with Sentry reporting by category.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::auth::AuthError;
use crate::commit::CommitError;
use crate::property::FieldError;
use crate::property_repository::RepoError;
use crate::reconciler::ReconcileError;
use crate::record_deleter::DeleteError;
use crate::staged_images::StageError;
use crate::upload_gateway::UploadErrorKind;

pub fn hash_pii(data: &str) -> String {
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// Error category determines whether an error should be reported to Sentry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Actual bugs that need investigation - ALWAYS report to Sentry
    Bug,
    /// Expected failures (auth, validation, not found) - never report to Sentry
    Expected,
    /// Operational issues (storage outages, timeouts) - report as warnings
    Operational,
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    /// User-facing message (sanitized)
    pub message: String,
    /// Logged, never returned to the client
    pub internal_message: Option<String>,
    pub operation: &'static str,
    pub category: ErrorCategory,
    pub context: Vec<(&'static str, String)>,
    /// Client should send the admin back to the login screen.
    pub reauthenticate: bool,
    /// Per-field validation problems.
    pub details: Vec<FieldError>,
}

impl AppError {
    fn build(
        status: StatusCode,
        operation: &'static str,
        category: ErrorCategory,
        message: String,
        internal_message: Option<String>,
    ) -> Self {
        Self {
            status,
            message,
            internal_message,
            operation,
            category,
            context: Vec::new(),
            reauthenticate: false,
            details: Vec::new(),
        }
    }

    pub fn bug(operation: &'static str, internal_msg: impl Into<String>) -> Self {
        Self::build(
            StatusCode::INTERNAL_SERVER_ERROR,
            operation,
            ErrorCategory::Bug,
            "Internal server error. Please try again.".to_string(),
            Some(internal_msg.into()),
        )
    }

    pub fn expected(
        status: StatusCode,
        operation: &'static str,
        user_msg: impl Into<String>,
    ) -> Self {
        Self::build(status, operation, ErrorCategory::Expected, user_msg.into(), None)
    }

    pub fn operational(
        status: StatusCode,
        operation: &'static str,
        user_msg: impl Into<String>,
        internal_msg: impl Into<String>,
    ) -> Self {
        Self::build(
            status,
            operation,
            ErrorCategory::Operational,
            user_msg.into(),
            Some(internal_msg.into()),
        )
    }

    #[must_use]
    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: Vec<FieldError>) -> Self {
        self.details = details;
        self
    }

    #[must_use]
    pub fn requiring_login(mut self) -> Self {
        self.reauthenticate = true;
        self
    }

    pub fn bad_request(operation: &'static str, message: impl Into<String>) -> Self {
        Self::expected(StatusCode::BAD_REQUEST, operation, message)
    }

    pub fn not_found(operation: &'static str, message: impl Into<String>) -> Self {
        Self::expected(StatusCode::NOT_FOUND, operation, message)
    }

    pub fn unauthorized(operation: &'static str, message: impl Into<String>) -> Self {
        Self::expected(StatusCode::UNAUTHORIZED, operation, message).requiring_login()
    }

    pub fn conflict(operation: &'static str, message: impl Into<String>) -> Self {
        Self::expected(StatusCode::CONFLICT, operation, message)
    }

    pub fn storage(operation: &'static str, err: impl fmt::Display, user_msg: impl Into<String>) -> Self {
        Self::operational(
            StatusCode::SERVICE_UNAVAILABLE,
            operation,
            user_msg,
            format!("Storage error: {err}"),
        )
    }

    pub fn repo(operation: &'static str, err: &RepoError) -> Self {
        match err {
            RepoError::NotFound(id) => Self::not_found(operation, format!("Property {id} not found")),
            RepoError::Unavailable(msg) => Self::bug(operation, format!("Database connection failed: {msg}"))
                .with_status(StatusCode::SERVICE_UNAVAILABLE)
                .with_message("Database temporarily unavailable. Please try again."),
            RepoError::Query(msg) | RepoError::Corrupt(msg) => {
                Self::bug(operation, format!("Database query failed: {msg}"))
            }
        }
    }

    pub fn auth(operation: &'static str, err: &AuthError) -> Self {
        match err {
            AuthError::NoSession | AuthError::InvalidCredentials | AuthError::RefreshFailed(_) => {
                Self::unauthorized(operation, err.to_string())
            }
            AuthError::Unavailable(msg) => Self::operational(
                StatusCode::SERVICE_UNAVAILABLE,
                operation,
                "Sign-in service unavailable. Please try again.",
                msg.clone(),
            ),
        }
    }

    pub fn commit(operation: &'static str, err: CommitError) -> Self {
        let stage = format!("{:?}", err.stage());
        let reauthenticate = err.requires_reauthentication();
        let mapped = match err {
            CommitError::Validation(details) => {
                Self::expected(StatusCode::UNPROCESSABLE_ENTITY, operation, "Some fields need attention")
                    .with_details(details)
            }
            CommitError::Session(ref auth) => Self::auth(operation, auth),
            CommitError::Upload { ref source, .. } => {
                let message = err.to_string();
                match source.kind() {
                    UploadErrorKind::InvalidFile => Self::bad_request(operation, message),
                    UploadErrorKind::Quota => {
                        Self::expected(StatusCode::PAYLOAD_TOO_LARGE, operation, message)
                    }
                    UploadErrorKind::Authentication => Self::unauthorized(operation, message),
                    UploadErrorKind::Configuration => Self::bug(operation, message.clone())
                        .with_status(StatusCode::SERVICE_UNAVAILABLE)
                        .with_message(message),
                    UploadErrorKind::Transient | UploadErrorKind::Other => {
                        Self::storage(operation, &message, message.clone())
                            .with_status(StatusCode::BAD_GATEWAY)
                    }
                }
            }
            CommitError::Merge { .. } => Self::bug(operation, err.to_string()),
            CommitError::Write(ref repo) => Self::repo(operation, repo),
            CommitError::AlreadyRunning => Self::conflict(operation, err.to_string()),
        };
        let mapped = mapped.with_context("stage", stage);
        if reauthenticate {
            mapped.requiring_login()
        } else {
            mapped
        }
    }

    pub fn stage(operation: &'static str, err: &StageError) -> Self {
        match err {
            StageError::LimitExceeded { .. } => {
                Self::expected(StatusCode::PAYLOAD_TOO_LARGE, operation, err.to_string())
            }
            StageError::UnknownItem(_) | StageError::OutOfRange { .. } => {
                Self::bad_request(operation, err.to_string())
            }
        }
    }

    pub fn reconcile(operation: &'static str, err: &ReconcileError) -> Self {
        match err {
            ReconcileError::Store(store) => {
                Self::storage(operation, store, "Storage is unavailable. Please try again.")
            }
            ReconcileError::Repo(repo) => Self::repo(operation, repo),
            ReconcileError::NoReferences { .. } => Self::bug(operation, err.to_string())
                .with_status(StatusCode::CONFLICT)
                .with_message(err.to_string()),
            ReconcileError::TooManyOrphans { .. } => Self::conflict(operation, err.to_string()),
            ReconcileError::AlreadyRunning => Self::conflict(operation, err.to_string()),
        }
    }

    pub fn delete(operation: &'static str, err: &DeleteError) -> Self {
        match err {
            DeleteError::NotFound(_) => Self::not_found(operation, err.to_string()),
            DeleteError::Load(repo) | DeleteError::Row(repo) => Self::repo(operation, repo),
            DeleteError::Blobs(store) => Self::storage(operation, store, err.to_string()),
            DeleteError::PartialBlobs { failed, .. } => {
                Self::storage(operation, format!("{failed:?}"), err.to_string())
                    .with_status(StatusCode::BAD_GATEWAY)
            }
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn report_to_sentry(&self) {
        match self.category {
            ErrorCategory::Bug => self.capture(sentry::Level::Error, "bug"),
            ErrorCategory::Operational => self.capture(sentry::Level::Warning, "operational"),
            ErrorCategory::Expected => self.add_sentry_breadcrumb(),
        }
    }

    fn capture(&self, level: sentry::Level, category: &'static str) {
        sentry::with_scope(
            |scope| {
                scope.set_fingerprint(Some(&[self.operation, category, self.status.as_str()]));
                for (key, value) in &self.context {
                    scope.set_extra(key, value.clone().into());
                }
                scope.set_tag("operation", self.operation);
                scope.set_tag("status_code", self.status.as_str());
                scope.set_tag("error_category", category);
            },
            || {
                let msg = format!(
                    "[{}] {} - {}",
                    self.operation,
                    self.status,
                    self.internal_message.as_deref().unwrap_or(&self.message)
                );
                sentry::capture_message(&msg, level);
            },
        );
    }

    fn add_sentry_breadcrumb(&self) {
        sentry::add_breadcrumb(sentry::Breadcrumb {
            category: Some("expected_error".into()),
            message: Some(format!(
                "[{}] {} - {}",
                self.operation, self.status, self.message
            )),
            level: sentry::Level::Info,
            data: self
                .context
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone().into()))
                .collect(),
            ..Default::default()
        });
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.operation, self.status, self.message)
    }
}

impl std::error::Error for AppError {}

#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: &'a str,
    code: &'a str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    reauthenticate: bool,
    #[serde(skip_serializing_if = "no_details")]
    details: &'a [FieldError],
}

fn no_details(details: &&[FieldError]) -> bool {
    details.is_empty()
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.report_to_sentry();

        let body = Json(ErrorResponse {
            error: &self.message,
            code: self.operation,
            reauthenticate: self.reauthenticate,
            details: &self.details,
        });

        (self.status, body).into_response()
    }
}
