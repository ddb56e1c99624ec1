//! Trellis: declarative controllers, policies and models on axum + sqlx.

pub mod case;
pub mod config;
pub mod controller;
pub mod error;
pub mod inject;
pub mod metadata;
pub mod model;
pub mod pipeline;
pub mod policy;
pub mod response;
pub mod routes;
pub mod server;
pub mod sql;
pub mod state;

pub use config::{init_tracing, AuthSettings, DatabaseSettings, ServerSettings};
pub use controller::{
    Controller, ControllerMetadata, ControllerRef, DispatchTable, HttpMethod, PolicyStage, RouteDescriptor, RouteDraft,
    RouteMetadata, RouteReflector,
};
pub use error::{AppError, ConfigError, QueryError, ResolutionError};
pub use inject::{Container, Injectable};
pub use metadata::{MetadataStore, Target};
pub use model::{FieldDef, FindOptions, Include, ModelDef, ModelRef, ModelRegistry, Page};
pub use pipeline::{
    DefaultErrorHandler, Interceptor, InterceptorRef, Next, RequestContext, RouteErrorHandler, RouteRequest,
    RouteResponse, TransactionInterceptor,
};
pub use policy::{Policy, PolicyDescriptor, PolicyId, PolicyResolver};
pub use response::{error_body, success_many, success_one};
pub use routes::common_routes;
pub use server::{Application, ServerMetadata};
pub use sql::SortDirection;
pub use state::AppState;
