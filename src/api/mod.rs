use crate::{
    api::{
        backend::BackendClient,
        handlers::{exchange, health, proxy},
    },
    config::SsoConfig,
};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::MatchedPath,
    http::{
        header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
        HeaderName, HeaderValue, Method, Request,
    },
    routing::{get, post},
    Extension, Router,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{info, info_span, Span};
use ulid::Ulid;
use url::Url;
use utoipa_swagger_ui::SwaggerUi;

pub mod backend;
pub mod handlers;
mod openapi;

pub use openapi::openapi;

/// Build the application router with its middleware stack.
///
/// # Errors
/// Returns an error if an allowed origin is not a valid URL origin.
pub fn router(backend: Arc<BackendClient>) -> Result<Router> {
    let cors = cors_layer(backend.config().allowed_origins())?;

    let app = Router::new()
        .route("/health", get(health::health).options(health::health))
        .route("/sso/receive", get(exchange::receive))
        .route("/api/auth/login", post(proxy::login))
        .route("/api/auth/refresh", post(proxy::refresh))
        .route("/api/auth/logout", post(proxy::logout))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Ulid::new().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors)
                .layer(Extension(backend)),
        );

    Ok(app)
}

/// Start the server
/// # Errors
/// Return error if failed to start the server
pub async fn new(port: u16, config: SsoConfig) -> Result<()> {
    let backend = BackendClient::new(Arc::new(config)).context("Failed to build backend client")?;
    let app = router(Arc::new(backend))?;

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", err);
            }
            info!("Gracefully shutdown");
        })
        .await?;

    Ok(())
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

fn cors_layer(allowed_origins: &[String]) -> Result<CorsLayer> {
    let origins = allowed_origins
        .iter()
        .map(|origin| origin_header(origin))
        .collect::<Result<Vec<_>>>()?;

    Ok(CorsLayer::new()
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            ACCEPT,
            HeaderName::from_static("x-xsrf-token"),
            HeaderName::from_static("x-csrf-token"),
            HeaderName::from_static("x-requested-with"),
        ])
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true))
}

fn origin_header(origin: &str) -> Result<HeaderValue> {
    let parsed = Url::parse(origin).with_context(|| format!("Invalid allowed origin: {origin}"))?;
    let serialized = parsed.origin().ascii_serialization();
    if serialized == "null" {
        anyhow::bail!("Allowed origin must include a scheme and host: {origin}");
    }
    HeaderValue::from_str(&serialized).context("Failed to build allowed origin header")
}
