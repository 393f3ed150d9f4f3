use shot_guard::Reason;
use tower::BoxError;

/// Errors produced by the Tower Guard middleware stack.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardError {
    /// The admission controller shed the request.
    ///
    /// When the `axum` feature is enabled, this converts to `503 Service Unavailable`.
    #[error("Service is overloaded; request dropped")]
    Overloaded,

    /// The circuit breaker rejected the request.
    ///
    /// When the `axum` feature is enabled, this converts to `503 Service Unavailable`.
    #[error("Service is unavailable; circuit breaker rejected request")]
    Unavailable,

    /// The balancer had no endpoint to send the request to.
    ///
    /// When the `axum` feature is enabled, this converts to `503 Service Unavailable`.
    #[error("No endpoint available")]
    NoEndpoint,

    /// An unexpected error occurred in the inner service.
    ///
    /// The string contains the `Display` representation of the inner error.
    /// When the `axum` feature is enabled, this converts to `500 Internal Server Error`.
    #[error("Internal service error: {0}")]
    Inner(String),
}

impl From<Reason> for GuardError {
    fn from(reason: Reason) -> Self {
        match reason {
            Reason::Overloaded => Self::Overloaded,
            Reason::Unavailable => Self::Unavailable,
            Reason::NoEndpoint => Self::NoEndpoint,
        }
    }
}

impl GuardError {
    /// Fold any error of a guarded stack into a boxed `GuardError`.
    ///
    /// Existing `GuardError`s pass through; anything else becomes [`GuardError::Inner`].
    pub fn map_boxed(err: BoxError) -> BoxError {
        if let Some(guard_err) = err.downcast_ref::<GuardError>() {
            BoxError::from(guard_err.clone())
        } else {
            BoxError::from(GuardError::Inner(err.to_string()))
        }
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for GuardError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match self {
            Self::Overloaded | Self::Unavailable | Self::NoEndpoint => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Inner(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}
