//! HTTP error envelope: `{ok: false, error, code, diagnostics?}`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::HubError;

/// Wrapper turning [`HubError`] into the wire envelope. Handlers return
/// `Result<_, ApiError>` and use `?` freely.
#[derive(Debug)]
pub struct ApiError(pub HubError);

impl From<HubError> for ApiError {
    fn from(err: HubError) -> Self {
        Self(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(HubError::Internal(err))
    }
}

fn status_for(err: &HubError) -> StatusCode {
    match err {
        HubError::NotFound { .. } => StatusCode::NOT_FOUND,
        HubError::InvalidName { .. } => StatusCode::BAD_REQUEST,
        HubError::NameConflict { .. }
        | HubError::StateViolation { .. }
        | HubError::PatchApplyConflict { .. }
        | HubError::BlockedConflict { .. }
        | HubError::BlockedPolicy { .. } => StatusCode::CONFLICT,
        HubError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        HubError::AuthFailure | HubError::UpstreamHttp { .. } => StatusCode::BAD_GATEWAY,
        HubError::EngineFailure { .. }
        | HubError::SeedMismatch { .. }
        | HubError::PatchApplyError { .. }
        | HubError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status = status_for(&err);

        // Internal detail stays in the logs; the wire gets the message only.
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(code = err.code(), error = %err, "request failed");
        }

        let mut body = json!({
            "ok": false,
            "error": err.to_string(),
            "code": err.code(),
        });
        if let HubError::PatchApplyConflict { conflict_files } = &err {
            body["diagnostics"] = json!({ "conflictFiles": conflict_files });
        }
        if let HubError::UpstreamHttp { status, .. } = &err {
            body["diagnostics"] = json!({ "upstreamStatus": status });
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            status_for(&HubError::not_found("drone x")),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&HubError::StateViolation {
                action: "rename".to_owned(),
                phase: crate::registry::HubPhase::Seeding,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&HubError::PatchApplyConflict {
                conflict_files: vec!["README.md".to_owned()],
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&HubError::Timeout {
                action: "seed".to_owned(),
                seconds: 1,
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(status_for(&HubError::AuthFailure), StatusCode::BAD_GATEWAY);
    }
}
