//! Application assembly: settings + declarations → container, models, routes, router.

use crate::config::ServerSettings;
use crate::controller::{Controller, ControllerRef, DispatchTable, RouteReflector};
use crate::error::{AppError, ConfigError};
use crate::inject::{Container, Injectable};
use crate::metadata::MetadataStore;
use crate::model::{ModelDef, ModelRegistry, ModelRegistryBuilder};
use crate::pipeline::{DefaultErrorHandler, InterceptorRef, PipelineStats, RouteErrorHandler};
use crate::policy::PolicyDescriptor;
use crate::routes::{common_routes, COMMON_PATHS};
use crate::state::AppState;
use axum::http::{Method, Uri};
use axum::Router;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::limit::RequestBodyLimitLayer;

/// Everything declared in code: controllers, models, server-wide policies and
/// interceptors, and the route error handler. Lists default to empty.
pub struct ServerMetadata {
    store: MetadataStore,
    controllers: Vec<ControllerRef>,
    models: ModelRegistryBuilder,
    policies: Vec<PolicyDescriptor>,
    interceptors: Vec<InterceptorRef>,
    error_handler: Arc<dyn RouteErrorHandler>,
}

impl ServerMetadata {
    /// Start from the store the controllers were declared in.
    pub fn new(store: MetadataStore) -> Self {
        ServerMetadata {
            store,
            controllers: Vec::new(),
            models: ModelRegistryBuilder::new(),
            policies: Vec::new(),
            interceptors: Vec::new(),
            error_handler: Arc::new(DefaultErrorHandler),
        }
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    /// Mount a top-level controller.
    pub fn controller<C: Controller + Injectable>(mut self) -> Self {
        self.controllers.push(ControllerRef::of::<C>());
        self
    }

    pub fn model(mut self, model: ModelDef) -> Self {
        self.models.add(model);
        self
    }

    /// Policy run before every route's own chain.
    pub fn policy(mut self, policy: PolicyDescriptor) -> Self {
        self.policies.push(policy);
        self
    }

    /// Interceptor wrapping every route, inside the default one.
    pub fn interceptor(mut self, interceptor: InterceptorRef) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn error_handler<H: RouteErrorHandler>(mut self, handler: H) -> Self {
        self.error_handler = Arc::new(handler);
        self
    }
}

/// A fully reflected application, ready to serve.
pub struct Application {
    settings: ServerSettings,
    container: Container,
    table: DispatchTable,
    router: Router,
}

impl Application {
    /// Open the database pool when one is configured, then assemble.
    pub async fn build(settings: ServerSettings, metadata: ServerMetadata) -> Result<Self, AppError> {
        let container = Container::new();
        if let Some(db) = &settings.database {
            let pool = PgPoolOptions::new()
                .max_connections(db.max_connections)
                .connect(&db.url)
                .await?;
            tracing::info!(max_connections = db.max_connections, "database pool ready");
            container.register(pool);
        }
        Self::assemble(settings, metadata, container)
    }

    /// Assemble against a container the caller has already populated (a pool, test
    /// doubles). Fails before any traffic is served if a declaration is inconsistent.
    pub fn assemble(settings: ServerSettings, metadata: ServerMetadata, container: Container) -> Result<Self, AppError> {
        container.register(settings.clone());
        if let Some(auth) = &settings.auth {
            container.register(auth.clone());
        }
        let registry = metadata.models.finish()?;
        tracing::info!(models = registry.len(), "models registered");
        container.register(registry);

        let stats = Arc::new(PipelineStats::default());
        let table = RouteReflector::new(&metadata.store, &container)
            .base_path(settings.base_path.clone())
            .policies(metadata.policies)
            .interceptors(metadata.interceptors)
            .error_handler(metadata.error_handler)
            .stats(Arc::clone(&stats))
            .reflect(&metadata.controllers)?;
        if let Some(clash) = table.descriptors().find(|d| COMMON_PATHS.contains(&d.path.as_str())) {
            return Err(ConfigError::DuplicateRoute {
                method: clash.method.to_string(),
                path: clash.path.clone(),
            }
            .into());
        }

        let state = AppState {
            container: container.clone(),
            stats,
            routes: table.len(),
            pool: container.get::<PgPool>().ok().map(|p| (*p).clone()),
        };
        let router = table
            .router()
            .merge(common_routes(state))
            .fallback(no_route)
            .layer(RequestBodyLimitLayer::new(settings.body_limit));
        for route in table.descriptors() {
            tracing::info!(route = %route, "mounted");
        }
        Ok(Application {
            settings,
            container,
            table,
            router,
        })
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn table(&self) -> &DispatchTable {
        &self.table
    }

    pub fn models(&self) -> Option<Arc<ModelRegistry>> {
        self.container.get::<ModelRegistry>().ok()
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Bind `0.0.0.0:<port>` and serve until the process stops.
    pub async fn serve(self) -> Result<(), AppError> {
        let listener = TcpListener::bind(("0.0.0.0", self.settings.port)).await?;
        tracing::info!(addr = %listener.local_addr()?, routes = self.table.len(), "listening");
        axum::serve(listener, self.router).await?;
        Ok(())
    }
}

async fn no_route(method: Method, uri: Uri) -> AppError {
    AppError::NotFound(format!("no route for {} {}", method, uri.path()))
}
