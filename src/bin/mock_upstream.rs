//! Demo upstream for trying SpecGate locally.
//!
//! Serves the pet store described by `demo/openapi.yaml`. A few routes
//! deliberately break the contract so every enforcement mode has something
//! to report:
//!
//! - `GET /v1/pets/0` omits the required `name` field
//! - `GET /v1/owners` is not documented at all
//! - `GET /v1/pets/export` returns a plain-text body

use std::net::SocketAddr;

use axum::{
    Json, Router,
    extract::Path,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde_json::json;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let port = std::env::var("MOCK_UPSTREAM_PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(3000);

    let app = Router::new()
        .route("/v1/pets", get(list_pets).post(create_pet))
        .route("/v1/owners", get(owners))
        .route("/v1/pets/export", get(export))
        .route("/v1/pets/{id}", get(show_pet));

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    tracing::info!(addr = %addr, "Mock upstream listening");

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!(addr = %addr, error = %e, "Failed to bind");
        e
    })?;

    axum::serve(listener, app).await.map_err(|e| {
        tracing::error!(error = %e, "Server error");
        e
    })?;

    Ok(())
}

async fn list_pets() -> impl IntoResponse {
    Json(json!([
        {"id": 1, "name": "Rex", "tag": "dog"},
        {"id": 2, "name": "Tom", "tag": null},
    ]))
}

async fn create_pet() -> impl IntoResponse {
    (StatusCode::CREATED, Json(json!({"id": 3, "name": "Nemo"})))
}

async fn show_pet(Path(id): Path<i64>) -> impl IntoResponse {
    match id {
        0 => (StatusCode::OK, Json(json!({"id": 0}))),
        id if id < 0 => (
            StatusCode::NOT_FOUND,
            Json(json!({"message": "pet not found"})),
        ),
        id => (StatusCode::OK, Json(json!({"id": id, "name": "Rex"}))),
    }
}

async fn owners() -> impl IntoResponse {
    Json(json!({"owners": []}))
}

async fn export() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/plain")], "1,Rex\n2,Tom\n")
}
