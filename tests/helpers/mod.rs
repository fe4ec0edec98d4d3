//! Shared fixtures for integration tests: a pet store upstream, a capturing
//! logger and a proxy served over a real socket.
#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::Path,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing,
};
use bytes::Bytes;
use hyper::Request;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::{Layer, ServiceExt};

use specgate::ValidatingProxy;
use specgate::contract::Contract;
use specgate::logging::{ColoredHandler, Level, Logger, SharedBuffer, Sink, strip_ansi};
use specgate::logging_layer::AccessLogLayer;
use specgate::proxy_service::ClientAddr;

/// A pet that violates the contract: `name` is required.
pub const INVALID_PET: &str = r#"{"id":0}"#;
pub const VALID_PETS: &str = r#"[{"id":1,"name":"Rex"},{"id":2,"name":"Tom","tag":null}]"#;
pub const EXPORT_BODY: &str = "id,name\n1,Rex\n{\"not\": json";

/// Logger writing every level into an in-memory buffer.
pub fn capture_logger() -> (Logger, SharedBuffer) {
    let buffer = SharedBuffer::default();
    let handler = ColoredHandler::new(Sink::from(buffer.clone()), Level::Debug);
    (Logger::new(Arc::new(handler)), buffer)
}

/// Captured lines with color codes removed.
pub fn log_lines(buffer: &SharedBuffer) -> Vec<String> {
    buffer.lines().iter().map(|l| strip_ansi(l)).collect()
}

/// Captured lines at `level` (`"WARN"`, `"ERROR"`, ...).
pub fn logs_at(buffer: &SharedBuffer, level: &str) -> Vec<String> {
    log_lines(buffer)
        .into_iter()
        .filter(|line| line.split(' ').nth(1) == Some(level))
        .collect()
}

pub fn petstore_document() -> Value {
    let pet_list = json!({
        "description": "pets",
        "content": {"application/json": {"schema": {
            "type": "array",
            "items": {"$ref": "#/components/schemas/Pet"}
        }}}
    });

    json!({
        "openapi": "3.0.3",
        "info": {"title": "Pet Store", "version": "1.0.0"},
        "servers": [{"url": "https://api.example.com/v1"}],
        "paths": {
            "/pets": {
                "get": {"operationId": "listPets", "responses": {"200": pet_list.clone()}},
                "delete": {
                    "operationId": "deletePets",
                    "responses": {"200": {
                        "description": "deleted",
                        "content": {"application/json": {"schema": {
                            "type": "object",
                            "required": ["deleted"],
                            "properties": {"deleted": {"type": "boolean"}}
                        }}}
                    }}
                }
            },
            "/pets/{petId}": {
                "get": {
                    "operationId": "showPet",
                    "responses": {
                        "200": {
                            "description": "pet",
                            "content": {"application/json": {"schema": {
                                "$ref": "#/components/schemas/Pet"
                            }}}
                        }
                    }
                }
            },
            "/export": {
                "get": {"operationId": "exportPets", "responses": {"200": pet_list.clone()}}
            },
            "/big": {
                "get": {"operationId": "bigList", "responses": {"200": pet_list.clone()}}
            },
            "/stream": {
                "get": {"operationId": "streamList", "responses": {"200": pet_list}}
            }
        },
        "components": {"schemas": {
            "Pet": {
                "type": "object",
                "required": ["id", "name"],
                "properties": {
                    "id": {"type": "integer"},
                    "name": {"type": "string"},
                    "tag": {"type": "string", "nullable": true}
                }
            }
        }}
    })
}

pub fn petstore() -> Contract {
    Contract::from_document(petstore_document()).expect("petstore contract is valid")
}

/// Array of `count` pets without the required `name`.
pub fn nameless_pets(count: usize) -> String {
    let items: Vec<String> = (0..count).map(|i| format!("{{\"id\":{i}}}")).collect();
    format!("[{}]", items.join(","))
}

/// Upstream serving the pet store under `/v1`.
pub fn petstore_upstream() -> Router {
    Router::new()
        .route(
            "/v1/pets",
            routing::get(|| async {
                ([(header::CONTENT_TYPE, "application/json")], VALID_PETS)
            })
            .delete(|| async { Json(json!({"deleted": true})) }),
        )
        .route(
            "/v1/pets/{id}",
            routing::get(show_pet).delete(|| async { Json(json!({"deleted": true})) }),
        )
        .route(
            "/v1/export",
            routing::get(|| async { ([(header::CONTENT_TYPE, "text/plain")], EXPORT_BODY) }),
        )
        .route(
            "/v1/big",
            routing::get(|| async {
                ([(header::CONTENT_TYPE, "application/json")], nameless_pets(100))
            }),
        )
        .route("/v1/stream", routing::get(stream_pets))
        .route("/v1/owners", routing::get(|| async { Json(json!({"owners": []})) }))
        .route("/v1/echo", routing::get(echo_headers))
}

async fn show_pet(Path(id): Path<i64>) -> Response {
    if id == 0 {
        return (
            [
                (header::CONTENT_TYPE, "application/json"),
                (header::ETAG, "\"abc123\""),
                (header::LAST_MODIFIED, "Wed, 21 Oct 2015 07:28:00 GMT"),
            ],
            INVALID_PET,
        )
            .into_response();
    }
    Json(json!({"id": id, "name": "Rex"})).into_response()
}

/// The same oversized list, chunked and without `Content-Length`.
async fn stream_pets() -> Response {
    let body = nameless_pets(100);
    let chunks: Vec<Result<Bytes, Infallible>> = body
        .as_bytes()
        .chunks(64)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from_stream(futures::stream::iter(chunks)))
        .expect("static response")
}

async fn echo_headers(headers: HeaderMap) -> impl IntoResponse {
    let value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    (
        StatusCode::OK,
        Json(json!({
            "host": value("host"),
            "x_forwarded_for": value("x-forwarded-for"),
            "x_request_id": value("x-request-id"),
        })),
    )
}

/// Serve `router` on an ephemeral port. Returns the base URL including `/v1`.
pub async fn spawn_upstream(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}/v1")
}

/// Upstream that answers the first request with `raw` bytes and hangs up.
pub async fn spawn_raw_upstream(raw: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(raw).await;
            let _ = stream.shutdown().await;
        }
    });
    format!("http://{addr}/v1")
}

/// A base URL nothing listens on.
pub async fn unreachable_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    format!("http://{addr}/v1")
}

/// Serve `proxy` on an ephemeral port the way the binary does.
pub async fn spawn_proxy(proxy: ValidatingProxy) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind proxy");
    let addr = listener.local_addr().expect("proxy addr");
    let shutdown = CancellationToken::new();

    tokio::spawn(async move {
        while let Ok((stream, peer)) = listener.accept().await {
            let service = AccessLogLayer::new(proxy.logger().clone()).layer(proxy.clone());
            let cancel = shutdown.child_token();
            tokio::spawn(async move {
                let _guard = cancel.clone().drop_guard();
                let svc_fn = hyper::service::service_fn(move |mut req: Request<Incoming>| {
                    req.extensions_mut().insert(cancel.child_token());
                    req.extensions_mut().insert(ClientAddr(peer));
                    service.clone().oneshot(req)
                });
                let _ = auto::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), svc_fn)
                    .await;
            });
        }
    });
    addr
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Reply {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub async fn send(method: reqwest::Method, addr: SocketAddr, path: &str) -> Reply {
    let response = reqwest::Client::new()
        .request(method, format!("http://{addr}{path}"))
        .send()
        .await
        .expect("proxy reachable");
    Reply {
        status: response.status(),
        headers: response.headers().clone(),
        body: response.bytes().await.expect("full body"),
    }
}

pub async fn get(addr: SocketAddr, path: &str) -> Reply {
    send(reqwest::Method::GET, addr, path).await
}
