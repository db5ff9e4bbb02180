pub mod routes;
pub mod state;

use axum::Router;
use state::ApiState;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the complete API router with all `/api/*` routes plus the
/// streaming fan-out at `/ws`.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .nest("/api", api_routes())
        .merge(routes::ws::router())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_routes() -> Router<ApiState> {
    Router::new()
        .nest("/weather", routes::weather::router())
        .nest("/freezer", routes::freezer::router())
        .nest("/door", routes::door::router())
        .nest("/light", routes::light::router())
        .nest("/devices", routes::devices::router())
        .nest("/ota", routes::ota::router())
        .nest("/alerts", routes::alerts::router())
        .merge(routes::health::router())
}
