//! HTTP gateway: routes, handlers, shared state, error mapping.

mod error;
pub mod handlers;
mod routes;
mod state;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::{AppState, GatewayLimits};
