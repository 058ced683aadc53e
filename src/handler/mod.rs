use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use output_bus::HandlerError;

pub mod output;

pub type ApiResult<T> = Result<T, ApiError>;
pub type ApiJsonResult<T> = ApiResult<Json<T>>;

pub struct ApiError(anyhow::Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        log::error!("ApiError: {:#}", self.0);
        let status = match self.0.downcast_ref::<HandlerError>() {
            Some(HandlerError::BadPath(_) | HandlerError::Config(_)) => StatusCode::BAD_REQUEST,
            Some(HandlerError::EncodersBusy) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, format!("{:#}", self.0)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
