//! Sample service: posts with authors, users with profiles.
//!
//! Run from repo root: `cargo run -p demo-app` with `PORT` and `DATABASE_URL` set.

use async_trait::async_trait;
use axum::http::StatusCode;
use serde_json::{json, Value};
use sqlx::PgPool;
use std::sync::Arc;
use trellis::model::timestamp;
use trellis::policy::BearerToken;
use trellis::{
    init_tracing, success_many, success_one, AppError, Application, Container, Controller, ControllerMetadata,
    FieldDef, FindOptions, Injectable, InterceptorRef, MetadataStore, ModelDef, ModelRegistry, PolicyDescriptor,
    ResolutionError, RouteMetadata, RouteRequest, RouteResponse, ServerMetadata, ServerSettings, SortDirection,
    TransactionInterceptor,
};

/// Base type carrying the read routes shared by every resource controller.
struct Listing;

struct PostsController {
    pool: PgPool,
    models: Arc<ModelRegistry>,
}

impl Injectable for PostsController {
    fn inject(container: &Container) -> Result<Self, ResolutionError> {
        Ok(PostsController {
            pool: (*container.get::<PgPool>()?).clone(),
            models: container.get::<ModelRegistry>()?,
        })
    }
}

#[async_trait]
impl Controller for PostsController {
    fn route_methods(&self) -> &[&'static str] {
        &["list", "show", "create", "update", "remove"]
    }

    async fn handle(&self, name: &str, req: &mut RouteRequest, res: &mut RouteResponse) -> Result<(), AppError> {
        let posts = self.models.model("Post")?;
        match name {
            "list" => {
                let page = posts.find_and_count_all(&self.pool, &find_options(req)?).await?;
                res.json(success_many(page.rows, Some(page.count)));
            }
            "show" => {
                let id = id_param(req)?;
                match posts.find_by_id(&self.pool, &id, &find_options(req)?).await? {
                    Some(post) => res.json(success_one(post)),
                    None => return Err(AppError::NotFound(format!("post {}", id))),
                };
            }
            "create" => {
                let post = posts.create(&self.pool, &req.body).await?;
                res.status(StatusCode::CREATED).json(success_one(post));
            }
            "update" => {
                let id = id_param(req)?;
                let mut rows = posts.update(&self.pool, &req.body, &json!({ "id": id })).await?;
                match rows.pop() {
                    Some(post) => res.json(success_one(post)),
                    None => return Err(AppError::NotFound(format!("post {}", id))),
                };
            }
            "remove" => {
                let id = id_param(req)?;
                if posts.destroy(&self.pool, &json!({ "id": id })).await? == 0 {
                    return Err(AppError::NotFound(format!("post {}", id)));
                }
                res.send_status(StatusCode::NO_CONTENT);
            }
            other => return Err(AppError::Handler(format!("unknown route method {}", other))),
        }
        Ok(())
    }
}

/// Users run inside a request transaction so the profile upsert and reads share it.
struct UsersController {
    models: Arc<ModelRegistry>,
}

impl Injectable for UsersController {
    fn inject(container: &Container) -> Result<Self, ResolutionError> {
        Ok(UsersController {
            models: container.get::<ModelRegistry>()?,
        })
    }
}

#[async_trait]
impl Controller for UsersController {
    fn route_methods(&self) -> &[&'static str] {
        &["list", "show", "save_profile"]
    }

    async fn handle(&self, name: &str, req: &mut RouteRequest, res: &mut RouteResponse) -> Result<(), AppError> {
        let scope = req
            .context()
            .transaction()
            .ok_or_else(|| AppError::Handler("users routes need a transaction".into()))?;
        let mut guard = scope.lock().await;
        let conn = guard.conn()?;
        match name {
            "list" => {
                let users = self.models.model("User")?;
                let rows = users.find_all(&mut *conn, &find_options(req)?).await?;
                res.json(success_many(rows, None));
            }
            "show" => {
                let users = self.models.model("User")?;
                let id = id_param(req)?;
                let options = find_options(req)?.include("profile");
                match users.find_by_id(&mut *conn, &id, &options).await? {
                    Some(user) => res.json(success_one(user)),
                    None => return Err(AppError::NotFound(format!("user {}", id))),
                };
            }
            "save_profile" => {
                let profiles = self.models.model("Profile")?;
                let id = id_param(req)?;
                let (profile, created) = profiles
                    .update_or_create(&mut *conn, &json!({ "user": id }), &req.body)
                    .await?;
                let status = if created { StatusCode::CREATED } else { StatusCode::OK };
                res.status(status).json(success_one(profile));
            }
            other => return Err(AppError::Handler(format!("unknown route method {}", other))),
        }
        Ok(())
    }
}

fn id_param(req: &RouteRequest) -> Result<Value, AppError> {
    let raw = req
        .param("id")
        .ok_or_else(|| AppError::BadRequest("missing id".into()))?;
    raw.parse::<i64>()
        .map(Value::from)
        .map_err(|_| AppError::BadRequest(format!("invalid id '{}'", raw)))
}

/// `?where=<json>&include=a,b.c&order=field[:desc]&limit=&offset=`
fn find_options(req: &RouteRequest) -> Result<FindOptions, AppError> {
    let mut options = FindOptions::new();
    if let Some(raw) = req.query_param("where") {
        let filter: Value =
            serde_json::from_str(raw).map_err(|e| AppError::BadRequest(format!("where: {}", e)))?;
        options = options.filter(filter);
    }
    if let Some(raw) = req.query_param("include") {
        for path in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            options = options.include(path);
        }
    }
    if let Some(raw) = req.query_param("order") {
        let (field, direction) = match raw.split_once(':') {
            Some((field, "desc")) => (field, SortDirection::Desc),
            Some((field, _)) => (field, SortDirection::Asc),
            None => (raw, SortDirection::Asc),
        };
        options = options.order_by(field, direction);
    }
    if let Some(raw) = req.query_param("limit") {
        let limit = raw
            .parse()
            .map_err(|_| AppError::BadRequest(format!("invalid limit '{}'", raw)))?;
        options = options.limit(limit);
    }
    if let Some(raw) = req.query_param("offset") {
        let offset = raw
            .parse()
            .map_err(|_| AppError::BadRequest(format!("invalid offset '{}'", raw)))?;
        options = options.offset(offset);
    }
    Ok(options)
}

fn declare(store: &MetadataStore) {
    store
        .route::<Listing>("list", RouteMetadata::get(""))
        .route::<Listing>("show", RouteMetadata::get(":id"));

    store
        .controller::<PostsController>(ControllerMetadata::new("posts"))
        .extends::<PostsController, Listing>()
        .route::<PostsController>("create", RouteMetadata::post("").policy(PolicyDescriptor::of::<BearerToken>()))
        .route::<PostsController>("update", RouteMetadata::patch(":id").policy(PolicyDescriptor::of::<BearerToken>()))
        .route::<PostsController>("remove", RouteMetadata::delete(":id").policy(PolicyDescriptor::of::<BearerToken>()));

    store
        .controller::<UsersController>(
            ControllerMetadata::new("users")
                .policy(PolicyDescriptor::of::<BearerToken>())
                .interceptor(InterceptorRef::of::<TransactionInterceptor>()),
        )
        .extends::<UsersController, Listing>()
        .route::<UsersController>("save_profile", RouteMetadata::put(":id/profile"));
}

fn models() -> Vec<ModelDef> {
    vec![
        ModelDef::new("User", "users")
            .field(FieldDef::new("id"))
            .field(FieldDef::new("name"))
            .field(FieldDef::new("email"))
            .field(FieldDef::timestamp("createdAt"))
            .has_one("profile", "Profile", "user_id"),
        ModelDef::new("Profile", "profiles")
            .field(FieldDef::new("id"))
            .field(FieldDef::new("bio"))
            .field(FieldDef::new("avatarUrl"))
            .belongs_to("user", "User", "user_id"),
        ModelDef::new("Post", "posts")
            .field(FieldDef::new("id"))
            .field(FieldDef::new("title"))
            .field(FieldDef::new("body"))
            .field(FieldDef::new("publishedAt").cast("timestamptz").transform(timestamp))
            .belongs_to("author", "User", "author_id"),
    ]
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = ServerSettings::from_env()?;
    init_tracing(&settings.log_level);

    let store = MetadataStore::new();
    declare(&store);
    let mut metadata = ServerMetadata::new(store)
        .controller::<PostsController>()
        .controller::<UsersController>()
        .policy(PolicyDescriptor::inline(|req, _res| {
            tracing::info!(method = %req.method, path = %req.path, "request");
            Ok(Value::Null)
        }));
    for model in models() {
        metadata = metadata.model(model);
    }

    let app = Application::build(settings, metadata).await?;
    app.serve().await?;
    Ok(())
}
