//! Maps [`tpn_common::Error`] onto HTTP responses (§7 Error Handling Design).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tpn_common::error::StatusFamily;

/// Newtype so handlers can `?`-propagate [`tpn_common::Error`] straight into
/// an axum response, keeping `tpn-common` itself web-framework agnostic.
pub struct ApiError(pub tpn_common::Error);

impl From<tpn_common::Error> for ApiError {
    fn from(err: tpn_common::Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.status_family() {
            StatusFamily::BadRequest => StatusCode::BAD_REQUEST,
            StatusFamily::Unauthorized => StatusCode::UNAUTHORIZED,
            StatusFamily::Forbidden => StatusCode::FORBIDDEN,
            StatusFamily::NotFound => StatusCode::NOT_FOUND,
            StatusFamily::Conflict => StatusCode::CONFLICT,
            StatusFamily::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            StatusFamily::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            StatusFamily::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}
