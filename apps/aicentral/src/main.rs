mod cli;
mod state;

use std::sync::Arc;
use std::time::Duration;

use aicentral_core::config::build_pipelines;
use aicentral_core::stream::STREAMING_TOKENS_TRAILER;
use aicentral_core::telemetry::EventHubRecorder;
use aicentral_core::upstream_client::{UpstreamClientConfig, WreqUpstreamClient};
use aicentral_core::DispatchBody;
use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use clap::Parser;
use futures_util::stream::{self, StreamExt};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use http_body::Frame;
use http_body_util::StreamBody;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use cli::CliArgs;
use state::AppState;

/// Upper bound on a buffered request body; anything larger is rejected
/// before it ever reaches a pipeline.
const MAX_REQUEST_BODY_BYTES: usize = 20 * 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = CliArgs::parse();
    let config_bytes = std::fs::read(&args.config)
        .map_err(|err| anyhow::anyhow!("reading config at {}: {err}", args.config))?;

    let upstream_client = Arc::new(WreqUpstreamClient::new(UpstreamClientConfig {
        proxy: args.proxy.clone(),
        ..Default::default()
    })?);
    let telemetry = Arc::new(EventHubRecorder::new(256));

    let pipelines = build_pipelines(&config_bytes, upstream_client, telemetry)?;
    tracing::info!(event = "pipelines_loaded", count = pipelines.len());
    let state = AppState::new(pipelines);

    let app = Router::new().fallback(handle).with_state(state);

    let listener = TcpListener::bind(&args.bind).await?;
    tracing::info!(event = "listening", addr = %args.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(args.shutdown_grace_secs))
        .await?;

    Ok(())
}

async fn handle(State(state): State<AppState>, req: Request) -> Response {
    let (parts, body) = req.into_parts();

    let host = parts
        .headers
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let Some(pipeline) = state.pipeline_for_host(&host) else {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("unknown host"))
            .expect("static response is well-formed");
    };

    let body = match to_bytes(body, MAX_REQUEST_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return Response::builder()
                .status(StatusCode::PAYLOAD_TOO_LARGE)
                .body(Body::from("request body too large"))
                .expect("static response is well-formed");
        }
    };

    // Run the pipeline on a detached task rather than awaiting it inline:
    // if the client disconnects, axum drops this handler future, but the
    // spawned task keeps running to completion so every admitted limiter
    // step still gets its `post` call instead of leaking its reservation.
    let method = parts.method;
    let path = parts.uri.path().to_string();
    let headers = parts.headers;
    let task = tokio::spawn(async move { pipeline.handle(method, &path, headers, body).await });

    match task.await {
        Ok(response) => to_axum_response(response),
        Err(_) => Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from("pipeline task panicked"))
            .expect("static response is well-formed"),
    }
}

fn to_axum_response(response: aicentral_core::PipelineResponse) -> Response {
    let mut builder = Response::builder().status(
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    );
    for (name, value) in &response.headers {
        builder = builder.header(name, value);
    }

    match response.body {
        DispatchBody::Buffered(bytes) => builder
            .body(Body::from(bytes))
            .expect("buffered response is well-formed"),
        DispatchBody::Streaming { chunks, tokens_done } => {
            let data_stream = chunks.map(|item| item.map(Frame::data));
            let trailer_stream = stream::once(async move {
                let tokens = tokens_done.await.unwrap_or(0);
                let mut trailers = HeaderMap::new();
                trailers.insert(
                    HeaderName::from_static(STREAMING_TOKENS_TRAILER),
                    HeaderValue::from_str(&tokens.to_string())
                        .unwrap_or_else(|_| HeaderValue::from_static("0")),
                );
                Ok(Frame::trailers(trailers))
            });
            let body_stream = data_stream.chain(trailer_stream);
            builder
                .body(Body::new(StreamBody::new(body_stream)))
                .expect("streaming response is well-formed")
        }
    }
}

/// Resolves once a shutdown signal arrives, which tells `axum::serve` to
/// stop admitting new connections and start draining in-flight ones. A
/// background timer force-exits once `grace_secs` passes so a stuck
/// request can't hang the process forever.
async fn shutdown_signal(grace_secs: u64) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("installing ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("installing SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!(event = "shutdown_signal_received", grace_secs);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(grace_secs)).await;
        tracing::warn!(event = "shutdown_grace_expired");
        std::process::exit(0);
    });
}
