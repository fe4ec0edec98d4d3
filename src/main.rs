//! SpecGate binary: load the contract, then serve the validating proxy.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use hyper::Request;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tower::{Layer, ServiceExt};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use specgate::config::{Cli, RuntimeConfig};
use specgate::contract;
use specgate::logging::{Attr, ColoredLayer, Level, Logger};
use specgate::logging_layer::AccessLogLayer;
use specgate::proxy_service::ClientAddr;
use specgate::ValidatingProxy;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.log_level.parse::<Level>() {
        Ok(level) => level,
        Err(e) => {
            eprintln!("specgate: {e}");
            return ExitCode::FAILURE;
        }
    };
    let logger = Logger::stderr(level);
    init_tracing(&logger, level);

    match run(cli, logger.clone()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            logger.error("Startup failed", &[Attr::new("error", e.to_string())]);
            ExitCode::FAILURE
        }
    }
}

/// Route `tracing` events from dependencies through the same colored handler.
fn init_tracing(logger: &Logger, level: Level) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(level.as_str().to_ascii_lowercase())
    });
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(ColoredLayer::new(logger.handler()))
        .try_init();
}

async fn run(cli: Cli, logger: Logger) -> Result<(), BoxError> {
    let runtime = RuntimeConfig::from_env();
    runtime.validate()?;

    let contract = contract::load(&cli.spec).await?;
    if let Err(e) = contract::check_origin(&cli.spec, &cli.upstream) {
        if !cli.allow_origin_mismatch {
            return Err(e.into());
        }
        logger.warn(
            "Continuing despite origin mismatch",
            &[Attr::new("error", e.to_string())],
        );
    }

    let proxy = ValidatingProxy::builder(contract, &cli.upstream, &cli.mode)
        .logger(logger.clone())
        .runtime(runtime.clone())
        .build()?;

    let shutdown = CancellationToken::new();

    #[cfg(feature = "metrics")]
    {
        let addr = SocketAddr::from(([127, 0, 0, 1], runtime.metrics_port));
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = specgate::metrics::serve(addr, token).await {
                error!(error = %e, "Metrics server error");
            }
        });
    }

    let addr = format!("{}:{}", cli.bind, cli.port);
    let listener = TcpListener::bind(&addr).await?;

    logger.info(
        "SpecGate starting",
        &[
            Attr::new("addr", &addr),
            Attr::new("upstream", proxy.config().upstream.as_str()),
            Attr::new("spec", &cli.spec),
            Attr::new("mode", proxy.mode().as_str()),
            Attr::new("operations", proxy.config().contract.operations().len()),
        ],
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    spawn_signal_handlers(&shutdown_tx);

    let semaphore = Arc::new(Semaphore::new(runtime.max_connections));
    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };

                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(
                            peer = %peer_addr,
                            max_connections = runtime.max_connections,
                            "Rejected connection: connection limit reached"
                        );
                        tokio::spawn(async move {
                            let _ = send_503_response(stream).await;
                        });
                        continue;
                    }
                };

                if let Err(e) = configure_tcp_stream(&stream, &runtime) {
                    warn!(error = %e, "Failed to configure socket");
                }

                let proxy = proxy.clone();
                let logger = logger.clone();
                let conn_shutdown_rx = shutdown_tx.subscribe();
                let cancel = shutdown.child_token();

                tokio::spawn(async move {
                    handle_connection(stream, peer_addr, proxy, logger, conn_shutdown_rx, cancel)
                        .await;
                    drop(permit);
                });
            }

            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping new connections");
                break;
            }
        }
    }

    let active = runtime.max_connections - semaphore.available_permits();
    info!(
        active_connections = active,
        timeout_secs = runtime.shutdown_timeout.as_secs(),
        "Waiting for active connections to drain"
    );

    let all = u32::try_from(runtime.max_connections).unwrap_or(u32::MAX);
    match tokio::time::timeout(runtime.shutdown_timeout, semaphore.acquire_many(all)).await {
        Ok(_) => info!("All connections drained, shutting down cleanly"),
        Err(_) => warn!(
            active_connections = runtime.max_connections - semaphore.available_permits(),
            "Shutdown timeout reached, forcing exit"
        ),
    }
    shutdown.cancel();

    Ok(())
}

fn spawn_signal_handlers(shutdown_tx: &broadcast::Sender<()>) {
    let tx = shutdown_tx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT, initiating graceful shutdown");
                let _ = tx.send(());
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGINT"),
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating graceful shutdown");
                    let _ = tx.send(());
                }
                Err(e) => error!(error = %e, "Failed to listen for SIGTERM"),
            }
        });
    }
}

/// Serve one connection. `cancel` fires when the connection ends, which
/// abandons any validation still running for it.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    proxy: ValidatingProxy,
    logger: Logger,
    mut shutdown_rx: broadcast::Receiver<()>,
    cancel: CancellationToken,
) {
    let _cancel_on_close = cancel.clone().drop_guard();

    let service = AccessLogLayer::new(logger).layer(proxy);
    let request_cancel = cancel.clone();
    let svc_fn = hyper::service::service_fn(move |mut req: Request<Incoming>| {
        req.extensions_mut().insert(request_cancel.child_token());
        req.extensions_mut().insert(ClientAddr(peer_addr));
        service.clone().oneshot(req)
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(stream), svc_fn);
    tokio::pin!(conn);

    tokio::select! {
        result = &mut conn => {
            if let Err(e) = result {
                warn!(peer = %peer_addr, error = %e, "Connection error");
            }
        }
        _ = shutdown_rx.recv() => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.await {
                warn!(peer = %peer_addr, error = %e, "Connection error during shutdown");
            }
        }
    }
}

fn configure_tcp_stream(stream: &TcpStream, config: &RuntimeConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    let socket = socket2::SockRef::from(stream);
    let keepalive =
        socket2::TcpKeepalive::new().with_time(Duration::from_secs(config.tcp_keepalive_secs));
    socket.set_tcp_keepalive(&keepalive)?;

    Ok(())
}

/// Answer a connection over the cap without reading its request.
async fn send_503_response(mut stream: TcpStream) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let body = r#"{"error":"Service Unavailable"}"#;
    let response = format!(
        "HTTP/1.1 503 Service Unavailable\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}
