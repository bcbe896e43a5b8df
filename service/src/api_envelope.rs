use axum::Json;
use axum::http::StatusCode;
use serde::Serialize;

pub type ApiErrorTuple = (StatusCode, Json<ApiErrorResponse>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorCode {
    ValidationError,
    Unauthorized,
    NotFound,
    DuplicateAnalysis,
    Conflict,
    UpstreamError,
    StorageError,
    DatabaseError,
    InternalError,
}

impl ApiErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NotFound => "NOT_FOUND",
            Self::DuplicateAnalysis => "DUPLICATE_ANALYSIS",
            Self::Conflict => "CONFLICT",
            Self::UpstreamError => "UPSTREAM_ERROR",
            Self::StorageError => "STORAGE_ERROR",
            Self::DatabaseError => "DATABASE_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    pub const fn default_status(self) -> StatusCode {
        match self {
            Self::ValidationError => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::DuplicateAnalysis | Self::Conflict => StatusCode::CONFLICT,
            Self::UpstreamError | Self::StorageError => StatusCode::BAD_GATEWAY,
            Self::DatabaseError | Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiErrorDetail {
    pub message: String,
    pub code: &'static str,
}

/// The failure arm of the envelope: `data` is always null, `error` always set.
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    pub data: Option<()>,
    pub error: ApiErrorDetail,
}

/// The success arm of the envelope: `data` always set, `error` always null.
#[derive(Debug, Serialize)]
pub struct ApiDataEnvelope<T> {
    pub data: T,
    pub error: Option<()>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PaginationMeta {
    pub page: u64,
    pub per_page: u64,
    pub total: u64,
}

#[derive(Debug, Serialize)]
pub struct ApiPaginatedEnvelope<T> {
    pub data: Vec<T>,
    pub pagination: PaginationMeta,
    pub error: Option<()>,
}

pub fn ok_data<T: Serialize>(data: T) -> (StatusCode, Json<ApiDataEnvelope<T>>) {
    (StatusCode::OK, Json(ApiDataEnvelope { data, error: None }))
}

pub fn created_data<T: Serialize>(data: T) -> (StatusCode, Json<ApiDataEnvelope<T>>) {
    (
        StatusCode::CREATED,
        Json(ApiDataEnvelope { data, error: None }),
    )
}

pub fn ok_page<T: Serialize>(
    data: Vec<T>,
    pagination: PaginationMeta,
) -> (StatusCode, Json<ApiPaginatedEnvelope<T>>) {
    (
        StatusCode::OK,
        Json(ApiPaginatedEnvelope {
            data,
            pagination,
            error: None,
        }),
    )
}

pub fn error_response(code: ApiErrorCode, message: impl Into<String>) -> ApiErrorTuple {
    (
        code.default_status(),
        Json(ApiErrorResponse {
            data: None,
            error: ApiErrorDetail {
                message: message.into(),
                code: code.as_str(),
            },
        }),
    )
}

pub fn validation_error(message: impl Into<String>) -> ApiErrorTuple {
    error_response(ApiErrorCode::ValidationError, message)
}

pub fn not_found_error(message: impl Into<String>) -> ApiErrorTuple {
    error_response(ApiErrorCode::NotFound, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_envelope_carries_null_error() {
        let (status, payload) = ok_data(serde_json::json!({"ok": true}));
        assert_eq!(status, StatusCode::OK);
        let body = serde_json::to_value(payload.0).expect("serialize payload");
        assert_eq!(body["data"]["ok"], true);
        assert!(body["error"].is_null());
    }

    #[test]
    fn error_envelope_carries_null_data() {
        let (status, payload) = error_response(ApiErrorCode::DuplicateAnalysis, "already running");
        assert_eq!(status, StatusCode::CONFLICT);
        let body = serde_json::to_value(payload.0).expect("serialize payload");
        assert!(body["data"].is_null());
        assert_eq!(body["error"]["code"], "DUPLICATE_ANALYSIS");
        assert_eq!(body["error"]["message"], "already running");
    }

    #[test]
    fn paginated_envelope_shape() {
        let (_, payload) = ok_page(
            vec![serde_json::json!({"id": 1})],
            PaginationMeta {
                page: 1,
                per_page: 20,
                total: 1,
            },
        );
        let body = serde_json::to_value(payload.0).expect("serialize payload");
        assert_eq!(body["pagination"]["total"], 1);
        assert!(body["error"].is_null());
    }

    #[test]
    fn status_mapping_matches_contract() {
        assert_eq!(
            ApiErrorCode::ValidationError.default_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiErrorCode::UpstreamError.default_status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiErrorCode::StorageError.default_status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiErrorCode::DatabaseError.default_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
