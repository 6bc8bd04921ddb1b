//! Web-framework glue.
//!
//! Lets handlers bubble [`DbScopeError`] straight out of axum routes: the
//! error is translated into a JSON error body with an appropriate status
//! code. Lifecycle misuse and engine failures are server faults; nothing in
//! this crate is the client's fault.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::core::DbScopeError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for DbScopeError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            DbScopeError::Configuration(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "configuration_error")
            }
            DbScopeError::SessionNotInitialised => {
                (StatusCode::INTERNAL_SERVER_ERROR, "session_not_initialised")
            }
            DbScopeError::MissingSession => {
                (StatusCode::INTERNAL_SERVER_ERROR, "missing_session")
            }
            DbScopeError::NoAmbientContext => {
                (StatusCode::INTERNAL_SERVER_ERROR, "no_ambient_context")
            }
            DbScopeError::SessionClosed => {
                (StatusCode::INTERNAL_SERVER_ERROR, "session_closed")
            }
            DbScopeError::Lock(_) => (StatusCode::INTERNAL_SERVER_ERROR, "lock_error"),
            DbScopeError::Transaction(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "transaction_error")
            }
            DbScopeError::Serialization(_) => {
                (StatusCode::UNPROCESSABLE_ENTITY, "serialization_error")
            }
        };

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TransactionError, TransactionOp};

    #[test]
    fn test_transaction_errors_map_to_500() {
        let err = DbScopeError::Transaction(TransactionError::new(
            TransactionOp::Commit,
            "disk full",
        ));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_serialization_errors_map_to_422() {
        let err = DbScopeError::Serialization("bad row".into());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
