use axum::{
    routing::{get, post},
    Extension, Router,
};
use std::net::SocketAddr;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::{http, session::SessionManager};

/// The bridge's full route set over the given session.
pub fn app(session: SessionManager) -> Router {
    Router::new()
        .route("/status", get(http::status))
        .route("/connect", post(http::connect))
        .route("/port", get(http::get_port).put(http::put_port))
        .route("/identification", get(http::identification))
        .route("/voltage", get(http::get_voltage).put(http::put_voltage))
        .route("/voltage/measured", get(http::measured_voltage))
        .route("/current", get(http::get_current).put(http::put_current))
        .route("/current/measured", get(http::measured_current))
        .route("/output", get(http::get_output).put(http::put_output))
        .route("/ovp", get(http::get_ovp).put(http::put_ovp))
        .route("/ocp", get(http::get_ocp).put(http::put_ocp))
        .route("/beep", get(http::get_beep).put(http::put_beep))
        .route("/mode", get(http::mode))
        .route("/lock", get(http::lock))
        .route("/resistance", get(http::resistance))
        .route("/power", get(http::power))
        .route("/power/target-voltage", get(http::target_voltage))
        .route("/presets/:slot/recall", post(http::recall))
        .route("/presets/:slot/save", post(http::save))
        // Each handler needs to be able to reach the session
        .layer(Extension(session))
        .layer(TraceLayer::new_for_http())
}

async fn run(
    session: SessionManager,
    addr: SocketAddr,
    allocated_port: Option<oneshot::Sender<u16>>,
) {
    let app = app(session);

    let server = axum::Server::bind(&addr).serve(app.into_make_service());
    let addr = server.local_addr();

    if let Some(port_reply) = allocated_port {
        port_reply
            .send(addr.port())
            .expect("The receiver of which port was allocated should not be dropped");
    }

    debug!("listening on {}", addr);

    server.await.unwrap();
}

/// Start the server on an arbitrary available localhost port.
/// The port allocated will be sent on the provided channel.
pub async fn run_any_port(session: SessionManager, allocated_port: oneshot::Sender<u16>) {
    let addr = SocketAddr::from(([127, 0, 0, 1], 0));
    run(session, addr, Some(allocated_port)).await
}

/// Start the server on the given address.
pub async fn run_on_addr(session: SessionManager, addr: SocketAddr) {
    run(session, addr, None).await
}
