//! Request pipeline: interceptor chain around the policy chain around the handler.

mod error_handler;
mod executor;
mod interceptor;
mod request;
mod transaction;

pub use error_handler::{DefaultErrorHandler, RouteErrorHandler};
pub use executor::{PipelineStats, RouteEndpoint, RoutePipeline};
pub use interceptor::{DefaultInterceptor, Interceptor, InterceptorRef, Next};
pub use request::{RequestContext, RouteRequest, RouteResponse};
pub use transaction::{TransactionGuard, TransactionInterceptor, TransactionScope};
