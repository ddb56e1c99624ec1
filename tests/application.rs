use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tower::ServiceExt;
use trellis::{
    AppError, Application, ConfigError, Container, Controller, ControllerMetadata, HttpMethod, Injectable,
    MetadataStore, Policy, PolicyDescriptor, ResolutionError, RouteMetadata, RouteRequest, RouteResponse,
    ServerMetadata, ServerSettings,
};

static CREATE_CALLS: AtomicUsize = AtomicUsize::new(0);

struct Widgets;

impl Injectable for Widgets {
    fn inject(_: &Container) -> Result<Self, ResolutionError> {
        Ok(Widgets)
    }
}

#[async_trait]
impl Controller for Widgets {
    fn route_methods(&self) -> &[&'static str] {
        &["create", "show", "echo", "list"]
    }

    async fn handle(&self, name: &str, req: &mut RouteRequest, res: &mut RouteResponse) -> Result<(), AppError> {
        match name {
            "create" => {
                CREATE_CALLS.fetch_add(1, Ordering::SeqCst);
                let user = req.context().policy_result_for::<RequireUser>().cloned();
                res.status(StatusCode::CREATED).json(json!({ "user": user }));
            }
            "show" => {
                res.json(json!({ "id": req.param("id"), "q": req.query_param("q") }));
            }
            "echo" => {
                res.json(req.body.clone());
            }
            "list" => {
                res.json(json!({ "from": "base" }));
            }
            _ => {}
        }
        Ok(())
    }
}

struct RequireUser;

impl Injectable for RequireUser {
    fn inject(_: &Container) -> Result<Self, ResolutionError> {
        Ok(RequireUser)
    }
}

#[async_trait]
impl Policy for RequireUser {
    async fn handle(&self, req: &mut RouteRequest, res: &mut RouteResponse) -> Result<Value, AppError> {
        match req.header("x-user") {
            Some(user) => Ok(json!(user)),
            None => {
                res.status(StatusCode::UNAUTHORIZED).json(json!({ "error": "who are you" }));
                Ok(Value::Null)
            }
        }
    }
}

/// Base type whose routes are inherited through `extends`.
struct Listing;

fn declare_widgets(store: &MetadataStore) {
    store
        .route::<Listing>("list", RouteMetadata::get(""))
        .controller::<Widgets>(ControllerMetadata::new("widgets"))
        .extends::<Widgets, Listing>()
        .route::<Widgets>("create", RouteMetadata::post("create").policy(PolicyDescriptor::of::<RequireUser>()))
        .route::<Widgets>("show", RouteMetadata::get(":id"))
        .route::<Widgets>("echo", RouteMetadata::post("echo"));
}

fn settings() -> ServerSettings {
    let mut settings = ServerSettings::new(0);
    settings.base_path = "/api".into();
    settings.body_limit = 64;
    settings
}

fn widgets_app() -> Application {
    let store = MetadataStore::new();
    declare_widgets(&store);
    let metadata = ServerMetadata::new(store).controller::<Widgets>();
    Application::assemble(settings(), metadata, Container::new()).unwrap()
}

async fn call(router: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn policy_short_circuits_before_handler() {
    let app = widgets_app();
    let before = CREATE_CALLS.load(Ordering::SeqCst);

    let (status, body) = call(app.router(), post_json("/api/widgets/create", "{}")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({ "error": "who are you" }));
    assert_eq!(CREATE_CALLS.load(Ordering::SeqCst), before);

    let request = Request::post("/api/widgets/create")
        .header("x-user", "ada")
        .body(Body::empty())
        .unwrap();
    let (status, body) = call(app.router(), request).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body, json!({ "user": "ada" }));
}

#[tokio::test]
async fn path_and_query_params_reach_the_handler() {
    let app = widgets_app();
    let request = Request::get("/api/widgets/42?q=blue").body(Body::empty()).unwrap();
    let (status, body) = call(app.router(), request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "id": "42", "q": "blue" }));
}

#[tokio::test]
async fn json_body_is_parsed() {
    let app = widgets_app();
    let (status, body) = call(app.router(), post_json("/api/widgets/echo", r#"{"name":"gear"}"#)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "name": "gear" }));
}

#[tokio::test]
async fn invalid_json_is_a_bad_request() {
    let app = widgets_app();
    let (status, body) = call(app.router(), post_json("/api/widgets/echo", "{nope")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], json!("bad_request"));
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let app = widgets_app();
    let payload = format!(r#"{{"blob":"{}"}}"#, "x".repeat(128));
    let request = Request::post("/api/widgets/echo")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, payload.len())
        .body(Body::from(payload))
        .unwrap();
    let response = app.router().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn oversized_streamed_body_is_rejected() {
    let app = widgets_app();
    let chunks: Vec<Result<String, std::io::Error>> = vec![
        Ok(r#"{"blob":""#.to_string()),
        Ok("x".repeat(64)),
        Ok("x".repeat(64)),
        Ok(r#""}"#.to_string()),
    ];
    let request = Request::post("/api/widgets/echo")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(futures_util::stream::iter(chunks)))
        .unwrap();
    assert!(request.headers().get(header::CONTENT_LENGTH).is_none());

    let (status, body) = call(app.router(), request).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"]["code"], json!("payload_too_large"));
}

#[tokio::test]
async fn inherited_route_is_served() {
    let app = widgets_app();
    assert!(app.table().find(HttpMethod::Get, "/api/widgets").is_some());
    let (status, body) = call(app.router(), Request::get("/api/widgets").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "from": "base" }));
}

#[tokio::test]
async fn unknown_path_falls_through_to_404() {
    let app = widgets_app();
    let (status, body) = call(app.router(), Request::get("/api/gadgets").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], json!("not_found"));
}

#[tokio::test]
async fn health_reports_routes_and_requests() {
    let app = widgets_app();
    call(app.router(), Request::get("/api/widgets/1").body(Body::empty()).unwrap()).await;

    let (status, body) = call(app.router(), Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));
    assert_eq!(body["routes"], json!(4));
    assert_eq!(body["requests"], json!(1));
    assert_eq!(body["in_flight"], json!(0));

    let (status, body) = call(app.router(), Request::get("/ready").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));
}

#[tokio::test]
async fn server_policies_run_before_route_policies() {
    let store = MetadataStore::new();
    declare_widgets(&store);
    let metadata = ServerMetadata::new(store)
        .controller::<Widgets>()
        .policy(PolicyDescriptor::inline(|req, _res| {
            req.headers.insert("x-user", "server".parse().unwrap());
            Ok(json!("first"))
        }));
    let app = Application::assemble(settings(), metadata, Container::new()).unwrap();

    let (status, body) = call(app.router(), post_json("/api/widgets/create", "{}")).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body, json!({ "user": "server" }));
}

struct Parts;

impl Injectable for Parts {
    fn inject(_: &Container) -> Result<Self, ResolutionError> {
        Ok(Parts)
    }
}

#[async_trait]
impl Controller for Parts {
    fn route_methods(&self) -> &[&'static str] {
        &["list"]
    }

    async fn handle(&self, _name: &str, _req: &mut RouteRequest, res: &mut RouteResponse) -> Result<(), AppError> {
        res.json(json!(["bolt"]));
        Ok(())
    }
}

#[tokio::test]
async fn child_controllers_nest_under_their_parent() {
    let store = MetadataStore::new();
    declare_widgets(&store);
    store
        .controller::<Widgets>(ControllerMetadata::new("widgets").child::<Parts>())
        .controller::<Parts>(ControllerMetadata::new("parts"))
        .route::<Parts>("list", RouteMetadata::get(""));
    let metadata = ServerMetadata::new(store).controller::<Widgets>();
    let app = Application::assemble(settings(), metadata, Container::new()).unwrap();

    assert!(app.table().find(HttpMethod::Get, "/api/widgets/parts").is_some());
    let (status, body) = call(app.router(), Request::get("/api/widgets/parts").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!(["bolt"]));
}

struct Gears;

impl Injectable for Gears {
    fn inject(_: &Container) -> Result<Self, ResolutionError> {
        Ok(Gears)
    }
}

#[async_trait]
impl Controller for Gears {
    fn route_methods(&self) -> &[&'static str] {
        &["show", "remove"]
    }

    async fn handle(&self, name: &str, req: &mut RouteRequest, res: &mut RouteResponse) -> Result<(), AppError> {
        res.json(json!({
            "handler": name,
            "id": req.param("id"),
            "gear_id": req.param("gear_id"),
        }));
        Ok(())
    }
}

#[tokio::test]
async fn routes_on_one_path_keep_their_own_param_names() {
    let store = MetadataStore::new();
    store
        .controller::<Gears>(ControllerMetadata::new("gears"))
        .route::<Gears>("show", RouteMetadata::get(":id"))
        .route::<Gears>("remove", RouteMetadata::delete(":gear_id"));
    let metadata = ServerMetadata::new(store).controller::<Gears>();
    let app = Application::assemble(settings(), metadata, Container::new()).unwrap();

    let (status, body) = call(app.router(), Request::get("/api/gears/3").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "handler": "show", "id": "3", "gear_id": null }));

    let (status, body) = call(app.router(), Request::delete("/api/gears/7").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "handler": "remove", "id": null, "gear_id": "7" }));
}

fn assemble_err(store: MetadataStore, metadata: impl FnOnce(ServerMetadata) -> ServerMetadata) -> ConfigError {
    let metadata = metadata(ServerMetadata::new(store));
    match Application::assemble(ServerSettings::new(0), metadata, Container::new()) {
        Err(AppError::Config(e)) => e,
        Err(other) => panic!("expected a config error, got {}", other),
        Ok(_) => panic!("expected assembly to fail"),
    }
}

#[test]
fn duplicate_controller_is_fatal() {
    let store = MetadataStore::new();
    declare_widgets(&store);
    let err = assemble_err(store, |m| m.controller::<Widgets>().controller::<Widgets>());
    assert!(matches!(err, ConfigError::DuplicateController(name) if name == "Widgets"));
}

#[test]
fn route_without_handler_is_fatal() {
    let store = MetadataStore::new();
    declare_widgets(&store);
    store.route::<Widgets>("archive", RouteMetadata::delete(":id"));
    let err = assemble_err(store, |m| m.controller::<Widgets>());
    assert!(matches!(err, ConfigError::MissingHandler { route, .. } if route == "archive"));
}

#[test]
fn duplicate_route_is_fatal() {
    let store = MetadataStore::new();
    declare_widgets(&store);
    store.route::<Widgets>("echo", RouteMetadata::post("create"));
    let err = assemble_err(store, |m| m.controller::<Widgets>());
    assert!(matches!(err, ConfigError::DuplicateRoute { path, .. } if path == "/widgets/create"));
}

#[test]
fn renamed_param_on_the_same_method_is_a_duplicate_route() {
    let store = MetadataStore::new();
    store
        .controller::<Gears>(ControllerMetadata::new("gears"))
        .route::<Gears>("show", RouteMetadata::get(":id"))
        .route::<Gears>("remove", RouteMetadata::get(":gear_id"));
    let err = assemble_err(store, |m| m.controller::<Gears>());
    assert!(matches!(err, ConfigError::DuplicateRoute { method, path } if method == "GET" && path == "/gears/:gear_id"));
}

#[test]
fn undeclared_controller_is_fatal() {
    let err = assemble_err(MetadataStore::new(), |m| m.controller::<Widgets>());
    assert!(matches!(err, ConfigError::MissingMetadata { kind: "controller", .. }));
}

#[test]
fn controller_route_on_a_common_path_is_fatal() {
    let store = MetadataStore::new();
    store
        .controller::<Parts>(ControllerMetadata::new(""))
        .route::<Parts>("list", RouteMetadata::post("health"));
    let err = assemble_err(store, |m| m.controller::<Parts>());
    assert!(matches!(err, ConfigError::DuplicateRoute { path, .. } if path == "/health"));
}

#[test]
fn models_are_registered_in_the_container() {
    use trellis::{FieldDef, ModelDef};

    let store = MetadataStore::new();
    declare_widgets(&store);
    let metadata = ServerMetadata::new(store)
        .controller::<Widgets>()
        .model(ModelDef::new("User", "users").field(FieldDef::new("id")))
        .model(
            ModelDef::new("Post", "posts")
                .field(FieldDef::new("id"))
                .belongs_to("author", "User", "author_id"),
        );
    let app = Application::assemble(settings(), metadata, Container::new()).unwrap();
    let models = app.models().unwrap();
    assert_eq!(models.len(), 2);
    assert!(models.model("Post").is_ok());

    let store = MetadataStore::new();
    let err = assemble_err(store, |m| {
        m.model(
            ModelDef::new("Post", "posts")
                .field(FieldDef::new("id"))
                .belongs_to("author", "Ghost", "author_id"),
        )
    });
    assert!(matches!(err, ConfigError::UnknownAssociationTarget { target, .. } if target == "Ghost"));
}

#[test]
fn container_shares_one_controller_instance() {
    let app = widgets_app();
    let a = app.container().resolve::<Widgets>().unwrap();
    let b = app.container().resolve::<Widgets>().unwrap();
    assert!(Arc::ptr_eq(&a, &b));
}
