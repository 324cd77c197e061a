use super::handlers::{exchange, health, proxy};
use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        exchange::receive,
        proxy::login,
        proxy::refresh,
        proxy::logout,
    ),
    components(schemas(health::Health, proxy::ProxyErrorBody, proxy::LoginRequest)),
    tags(
        (name = "health", description = "Liveness"),
        (name = "sso", description = "Cross-domain hand-off exchange"),
        (name = "auth", description = "Same-origin proxy to the backend auth API")
    )
)]
pub struct ApiDoc;

#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    ApiDoc::openapi()
}
