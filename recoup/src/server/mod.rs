//! The HTTP server: router construction, middleware, and graceful serving.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, patch, post},
};
use recoup_common::{shutdown::Shutdown, task::NamedTask};
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, error, info, warn};

use crate::App;

pub mod auth;
pub mod error;
pub mod models;

mod handlers;

/// Provider events can carry fat expanded objects; anything bigger than
/// this is not a webhook we want.
const BODY_LIMIT: usize = 64 * 1024;
/// Per-request handling timeout.
const HANDLING_TIMEOUT: Duration = Duration::from_secs(15);
/// Refuse new connections and wait this long for in-flight requests.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(3);
/// Hard cap on the whole server shutdown.
const SERVER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) fn router(app: Arc<App>) -> Router<()> {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/dashboard", get(handlers::dashboard))
        .route(
            "/tasks",
            get(handlers::list_tasks).post(handlers::create_task),
        )
        .route("/tasks/completed", delete(handlers::delete_completed))
        .route(
            "/tasks/{id}",
            get(handlers::get_task).delete(handlers::delete_task),
        )
        .route("/tasks/{id}/retry", post(handlers::retry_task))
        .route("/merchants/{id}", patch(handlers::update_merchant))
        .route("/email-templates", post(handlers::upsert_template))
        .route("/activity", get(handlers::activity))
        .route("/worker/claim", post(handlers::worker_claim))
        .route("/worker/complete/{id}", post(handlers::worker_complete))
        .route("/pp/connect/authorize", post(handlers::authorize))
        .route("/pp/connect/callback", get(handlers::callback))
        .route("/pp/disconnect", post(handlers::disconnect))
        .route("/webhooks/pp", post(crate::webhook::handle))
        .route("/track/open/{log_id}", get(handlers::track_open))
        .route("/track/click", get(handlers::track_click))
        .route("/admin/merchants/{id}", delete(handlers::erase_merchant))
        .layer(TimeoutLayer::new(HANDLING_TIMEOUT))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .with_state(app)
}

/// Bind and spawn the HTTP server task. Returns the task and the url it is
/// reachable at. A shutdown signal triggers a graceful drain: new
/// connections are refused, in-flight requests get the grace period, then a
/// hard stop.
pub(crate) fn spawn_server(
    app: Arc<App>,
    shutdown: Shutdown,
) -> anyhow::Result<(NamedTask<()>, String)> {
    let listen_addr = app.config.listen_addr;
    let listener = std::net::TcpListener::bind(listen_addr)
        .with_context(|| format!("Could not bind {listen_addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("Could not read listener local addr")?;
    let server_url = format!("http://{local_addr}");

    // ConnectInfo gives handlers the peer address for rate limiting and
    // security logging.
    let make_service = router(app)
        .into_make_service_with_connect_info::<SocketAddr>();

    let handle = axum_server::Handle::new();
    let server_fut = {
        let handle = handle.clone();
        async move {
            axum_server::from_tcp(listener)
                .handle(handle)
                .serve(make_service)
                .await
                // axum's MakeService is infallible and the listener is
                // already bound.
                .expect("Server accept loop cannot error");
            info!("HTTP server finished");
        }
    };

    let graceful_fut = async move {
        shutdown.recv().await;
        info!("Shutting down HTTP server");
        handle.graceful_shutdown(Some(SHUTDOWN_GRACE_PERIOD));
    };

    let server_task = NamedTask::spawn("(server)", async move {
        tokio::pin!(server_fut);
        tokio::select! {
            biased;
            () = graceful_fut => (),
            () = &mut server_fut => return error!("Server exited early"),
        }
        match tokio::time::timeout(SERVER_SHUTDOWN_TIMEOUT, server_fut).await
        {
            Ok(()) => debug!("HTTP server graceful shutdown success"),
            Err(_) => warn!("HTTP server timed out during shutdown"),
        }
    });

    Ok((server_task, server_url))
}
