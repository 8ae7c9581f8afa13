//! mixtrack demo server.
//!
//! Shows the middleware in a real axum app: `GET /hello` sets the caller's
//! profile name and tracks a page view, `GET /health` does nothing with
//! Mixpanel (and therefore never flushes).
//!
//! ## Configuration
//!
//! - `MIXTRACK_CONFIG`: path to the TOML config (default: `config/mixtrack.toml`)
//! - `RUST_LOG`: logging level (default: "info")
//!
//! The caller is identified by the `X-User-Id` header.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::{self, Next},
    response::{Json, Response},
    routing::get,
    Extension, Router,
};
use mixtrack::config::{LogFormat, TrackConfig};
use mixtrack::consumer::{Consumer, Message, PoliteBufferedConsumer, Transports};
use mixtrack::customerio::CustomerIo;
use mixtrack::middleware::{mixpanel_middleware, DistinctId, MixpanelState, RequestMixpanel};
use mixtrack::{EventProperties, Events, ProfileProperties, Properties, Registry, TrackError};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() {
    // 1. Load configuration
    dotenvy::dotenv().ok();
    let config = match TrackConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // 2. Initialize Logging
    init_logging(config.logging.format);

    // 3. Background delivery for QueuedConsumer
    let (queue, queued) = tokio::sync::mpsc::unbounded_channel();
    let transports = Transports {
        http: reqwest::Client::new(),
        queue: Some(queue),
    };
    let mut delivery = PoliteBufferedConsumer::new(&config.mixpanel.api_host)
        .with_client(transports.http.clone());
    match CustomerIo::from_config(&config.customerio, transports.http.clone()) {
        Ok(Some(cio)) => delivery = delivery.with_secondary(Arc::new(cio)),
        Ok(None) => {}
        Err(e) => {
            error!(error = %e, "Invalid customer.io configuration");
            std::process::exit(1);
        }
    }
    tokio::spawn(deliver_queued(queued, delivery));

    // 4. Validate Mixpanel setup
    let state = match MixpanelState::with_transports(config, Registry::new(), transports) {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "Invalid Mixpanel configuration");
            std::process::exit(1);
        }
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config().server.port));

    // 5. Build Router; identify_user must run before the Mixpanel middleware
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/hello", get(hello))
        .layer(middleware::from_fn_with_state(state, mixpanel_middleware))
        .layer(middleware::from_fn(identify_user));

    // 6. Start Server
    info!("mixtrack demo listening on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %addr, "Failed to bind");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "Server error");
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}

/// Drain the task queue, flushing whenever it runs empty.
async fn deliver_queued(
    mut queued: UnboundedReceiver<Message>,
    mut consumer: PoliteBufferedConsumer,
) {
    while let Some(message) = queued.recv().await {
        consumer.send(message);
        while let Ok(message) = queued.try_recv() {
            consumer.send(message);
        }
        consumer.flush().await;
    }
    debug!("Task queue closed");
}

/// Stand-in for real authentication.
async fn identify_user(mut req: Request, next: Next) -> Response {
    let user = req
        .headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Some(user) = user {
        req.extensions_mut().insert(DistinctId(user));
    }
    next.run(req).await
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn hello(
    Extension(mixpanel): Extension<RequestMixpanel>,
) -> Result<Json<Value>, StatusCode> {
    let distinct_id = mixpanel
        .with(|track| {
            track.profile_set(
                Properties::from([(ProfileProperties::DOLLAR_NAME, json!("Hello Visitor"))]),
                Properties::new(),
            )?;
            track.track(
                &Events::PAGE_VIEWED,
                Properties::from([
                    (EventProperties::PATH, json!("/hello")),
                    (EventProperties::TITLE, json!("Hello")),
                ]),
            )?;
            Ok(track.distinct_id().map(str::to_string))
        })
        .map_err(tracking_error)?;

    Ok(Json(json!({ "hello": distinct_id })))
}

fn tracking_error(e: TrackError) -> StatusCode {
    match e {
        TrackError::DistinctIdRequired => StatusCode::UNAUTHORIZED,
        e => {
            error!(error = %e, "Tracking failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
