use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, MatchedPath, Query, Request, State},
    http::Method,
    routing::{get, post},
    Json,
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    http_objects::{ApiError, FunctionListEntry, LogsParams, UploadRequest, UploadUrlRequest},
    orchestrator::Orchestrator,
};

#[derive(OpenApi)]
#[openapi(
        paths(
            upload,
            upload_url,
            delete_function,
            wipe_functions,
            list_functions,
            function_logs,
        ),
        components(
            schemas(
                ApiError,
                UploadRequest,
                UploadUrlRequest,
                FunctionListEntry,
            )
        ),
        tags(
            (name = "nimbus", description = "Function management API")
        )
    )]

struct ApiDoc;

#[derive(Clone)]
pub struct RouteState {
    pub orchestrator: Arc<Orchestrator>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .merge(SwaggerUi::new("/docs/swagger").url("/docs/openapi.json", ApiDoc::openapi()))
        .route("/", get(index))
        .route("/upload", post(upload).with_state(route_state.clone()))
        .route("/uploadURL", post(upload_url).with_state(route_state.clone()))
        .route(
            "/delete",
            post(delete_function).with_state(route_state.clone()),
        )
        .route(
            "/wipe",
            post(wipe_functions).with_state(route_state.clone()),
        )
        .route(
            "/list",
            get(list_functions).with_state(route_state.clone()),
        )
        .route(
            "/logs",
            get(function_logs).with_state(route_state.clone()),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let method = req.method();
                    let uri = req.uri();

                    let matched_path = req
                        .extensions()
                        .get::<MatchedPath>()
                        .map(|matched_path| matched_path.as_str());

                    tracing::debug_span!("request", %method, %uri, matched_path)
                })
                .on_failure(()),
        )
        .layer(cors)
        .layer(DefaultBodyLimit::max(usize::MAX))
}

async fn index() -> &'static str {
    "Nimbus Server"
}

/// Deploy a function from an inlined package
#[utoipa::path(
    post,
    path = "/upload",
    request_body = UploadRequest,
    tag = "operations",
    responses(
        (status = 200, description = "Function deployed", body = FunctionListEntry),
        (status = BAD_REQUEST, description = "Invalid deployment request"),
        (status = INTERNAL_SERVER_ERROR, description = "Unable to deploy function")
    ),
)]
async fn upload(
    State(state): State<RouteState>,
    Json(request): Json<UploadRequest>,
) -> Result<Json<FunctionListEntry>, ApiError> {
    let spec = request.into_spec()?;
    let deployment = state.orchestrator.deploy(spec).await?;
    Ok(Json(FunctionListEntry::from(deployment.as_ref())))
}

/// Deploy a function from a remote package archive
#[utoipa::path(
    post,
    path = "/uploadURL",
    request_body = UploadUrlRequest,
    tag = "operations",
    responses(
        (status = 200, description = "Function deployed", body = FunctionListEntry),
        (status = BAD_REQUEST, description = "Invalid deployment request"),
        (status = INTERNAL_SERVER_ERROR, description = "Unable to deploy function")
    ),
)]
async fn upload_url(
    State(state): State<RouteState>,
    Json(request): Json<UploadUrlRequest>,
) -> Result<Json<FunctionListEntry>, ApiError> {
    let spec = request.into_spec()?;
    let deployment = state.orchestrator.deploy(spec).await?;
    Ok(Json(FunctionListEntry::from(deployment.as_ref())))
}

/// Delete a function by name. The body is the bare function name. Deleting
/// an unknown name answers 200 with the literal body `Not found`.
#[utoipa::path(
    post,
    path = "/delete",
    request_body = String,
    tag = "operations",
    responses(
        (status = 200, description = "Function deleted, or no such function"),
        (status = INTERNAL_SERVER_ERROR, description = "Unable to delete function")
    ),
)]
async fn delete_function(
    State(state): State<RouteState>,
    body: String,
) -> Result<&'static str, ApiError> {
    let name = body.trim();
    match state.orchestrator.delete(name).await {
        Ok(()) => Ok(""),
        Err(crate::error::Error::NotFound(_)) => Ok("Not found"),
        Err(e) => Err(e.into()),
    }
}

/// Delete every deployed function
#[utoipa::path(
    post,
    path = "/wipe",
    tag = "operations",
    responses(
        (status = 200, description = "All functions deleted"),
        (status = INTERNAL_SERVER_ERROR, description = "Unable to delete all functions")
    ),
)]
async fn wipe_functions(State(state): State<RouteState>) -> Result<(), ApiError> {
    state.orchestrator.wipe().await?;
    Ok(())
}

/// List deployed functions
#[utoipa::path(
    get,
    path = "/list",
    tag = "operations",
    responses(
        (status = 200, description = "Deployed functions", body = Vec<FunctionListEntry>),
    ),
)]
async fn list_functions(State(state): State<RouteState>) -> Json<Vec<FunctionListEntry>> {
    let entries = state
        .orchestrator
        .list()
        .await
        .iter()
        .map(|deployment| FunctionListEntry::from(deployment.as_ref()))
        .collect();
    Json(entries)
}

/// Replica logs, for one function or for all of them
#[utoipa::path(
    get,
    path = "/logs",
    params(LogsParams),
    tag = "operations",
    responses(
        (status = 200, description = "Replica log lines"),
        (status = NOT_FOUND, description = "No such function"),
    ),
)]
async fn function_logs(
    State(state): State<RouteState>,
    Query(params): Query<LogsParams>,
) -> Result<String, ApiError> {
    let lines = state.orchestrator.logs(params.name.as_deref()).await?;
    Ok(lines.join("\n"))
}
