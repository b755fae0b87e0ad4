use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::SchedulerError;
use crate::manager::PlacementError;

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    pub retryable: bool,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("urn:vmsched:problem:{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            code,
            retryable: false,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn insufficient_storage(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INSUFFICIENT_STORAGE, code, message)
    }

    pub fn bad_gateway(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_GATEWAY, code, message)
    }

    pub fn unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut error = Self::with_status(StatusCode::SERVICE_UNAVAILABLE, code, message);
        error.problem.retryable = true;
        error
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        let code = e.reason_code();
        let detail = e.to_string();
        match &e {
            SchedulerError::Validation(_) => Self::bad_request(code, detail),
            SchedulerError::Placement(placement) => match placement {
                PlacementError::NoCapacity { .. } => Self::insufficient_storage(code, detail),
                PlacementError::NotFound(_)
                | PlacementError::NameNotFound(_)
                | PlacementError::SubsetNotFound(_) => Self::not_found(code, detail),
                PlacementError::AlreadyPlaced(_)
                | PlacementError::NameTaken(_)
                | PlacementError::Subset(_) => Self::conflict(code, detail),
            },
            SchedulerError::Hypervisor(_) => Self::bad_gateway(code, detail),
            SchedulerError::ShuttingDown => Self::unavailable(code, detail),
            SchedulerError::Endpoint(_) | SchedulerError::Topology(_) => {
                tracing::error!(error = %e, "Unexpected scheduler error");
                Self::internal(code, detail)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DomainId, ValidationError};
    use crate::topology::ResourceKind;

    #[test]
    fn test_status_mapping() {
        let uuid = DomainId::new();
        let cases = [
            (
                SchedulerError::from(PlacementError::NoCapacity {
                    uuid,
                    kind: ResourceKind::Memory,
                }),
                StatusCode::INSUFFICIENT_STORAGE,
            ),
            (
                PlacementError::AlreadyPlaced(uuid).into(),
                StatusCode::CONFLICT,
            ),
            (PlacementError::NotFound(uuid).into(), StatusCode::NOT_FOUND),
            (
                ValidationError::MissingField("name").into(),
                StatusCode::BAD_REQUEST,
            ),
            (SchedulerError::ShuttingDown, StatusCode::SERVICE_UNAVAILABLE),
        ];

        for (error, status) in cases {
            let code = error.reason_code();
            let api = ApiError::from(error);
            assert_eq!(api.status, status);
            assert_eq!(api.problem.code, code);
        }
    }
}
