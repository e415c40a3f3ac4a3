//! The HTTP face of the bridge.
//!
//! Each handler maps one route onto exactly one session manager
//! operation and serializes the outcome. No device-state logic lives
//! here- not even "are we connected", which is the session's call.

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    device::OperatingMode,
    error::Error,
    session::{Connected, PortChange, PowerReading, SessionManager, SessionStatus},
};

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::BadInput(_) => StatusCode::BAD_REQUEST,
            Error::NotConnected => StatusCode::CONFLICT,
            Error::ConnectFailed { .. }
            | Error::BusyAndUnresponsive { .. }
            | Error::ConnectionLost(_)
            | Error::Device(_) => StatusCode::BAD_GATEWAY,
            Error::Settings(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Both the typed error and a human-readable rendering.
        let message = self.to_string();
        let body = Json(json!({
            "error": self,
            "message": message,
        }));

        (status, body).into_response()
    }
}

type Session = Extension<SessionManager>;

pub(crate) async fn status(Extension(session): Session) -> Json<SessionStatus> {
    Json(session.status().await)
}

pub(crate) async fn connect(Extension(session): Session) -> Result<Json<Connected>, Error> {
    session.connect().await.map(Json)
}

pub(crate) async fn get_port(Extension(session): Session) -> Json<String> {
    Json(session.port().await)
}

#[derive(Debug, Deserialize)]
pub(crate) struct PortBody {
    port: String,
}

pub(crate) async fn put_port(
    Extension(session): Session,
    Json(body): Json<PortBody>,
) -> Result<Json<PortChange>, Error> {
    session.set_port(&body.port).await.map(Json)
}

pub(crate) async fn identification(Extension(session): Session) -> Result<Json<String>, Error> {
    session.identification().await.map(Json)
}

pub(crate) async fn get_voltage(Extension(session): Session) -> Result<Json<f64>, Error> {
    session.voltage_setpoint().await.map(Json)
}

pub(crate) async fn put_voltage(
    Extension(session): Session,
    Json(volts): Json<f64>,
) -> Result<Json<f64>, Error> {
    session.set_voltage(volts).await?;
    Ok(Json(volts))
}

pub(crate) async fn measured_voltage(Extension(session): Session) -> Result<Json<f64>, Error> {
    session.measured_voltage().await.map(Json)
}

pub(crate) async fn get_current(Extension(session): Session) -> Result<Json<f64>, Error> {
    session.current_setpoint().await.map(Json)
}

pub(crate) async fn put_current(
    Extension(session): Session,
    Json(amps): Json<f64>,
) -> Result<Json<f64>, Error> {
    session.set_current(amps).await?;
    Ok(Json(amps))
}

pub(crate) async fn measured_current(Extension(session): Session) -> Result<Json<f64>, Error> {
    session.measured_current().await.map(Json)
}

pub(crate) async fn get_output(Extension(session): Session) -> Result<Json<bool>, Error> {
    session.output_enabled().await.map(Json)
}

pub(crate) async fn put_output(
    Extension(session): Session,
    Json(on): Json<bool>,
) -> Result<Json<bool>, Error> {
    session.set_output(on).await?;
    Ok(Json(on))
}

pub(crate) async fn get_ovp(Extension(session): Session) -> Result<Json<bool>, Error> {
    session.ovp_enabled().await.map(Json)
}

pub(crate) async fn put_ovp(
    Extension(session): Session,
    Json(on): Json<bool>,
) -> Result<Json<bool>, Error> {
    session.set_ovp(on).await?;
    Ok(Json(on))
}

pub(crate) async fn get_ocp(Extension(session): Session) -> Result<Json<bool>, Error> {
    session.ocp_enabled().await.map(Json)
}

pub(crate) async fn put_ocp(
    Extension(session): Session,
    Json(on): Json<bool>,
) -> Result<Json<bool>, Error> {
    session.set_ocp(on).await?;
    Ok(Json(on))
}

pub(crate) async fn get_beep(Extension(session): Session) -> Result<Json<bool>, Error> {
    session.beep_enabled().await.map(Json)
}

pub(crate) async fn put_beep(
    Extension(session): Session,
    Json(on): Json<bool>,
) -> Result<Json<bool>, Error> {
    session.set_beep(on).await?;
    Ok(Json(on))
}

pub(crate) async fn mode(Extension(session): Session) -> Result<Json<OperatingMode>, Error> {
    session.mode().await.map(Json)
}

pub(crate) async fn lock(Extension(session): Session) -> Result<Json<bool>, Error> {
    session.panel_locked().await.map(Json)
}

pub(crate) async fn resistance(Extension(session): Session) -> Result<Json<f64>, Error> {
    session.resistance().await.map(Json)
}

pub(crate) async fn power(Extension(session): Session) -> Result<Json<PowerReading>, Error> {
    session.power().await.map(Json)
}

#[derive(Debug, Deserialize)]
pub(crate) struct TargetQuery {
    watts: f64,
}

pub(crate) async fn target_voltage(
    Extension(session): Session,
    Query(query): Query<TargetQuery>,
) -> Result<Json<f64>, Error> {
    session.target_voltage(query.watts).await.map(Json)
}

pub(crate) async fn recall(
    Extension(session): Session,
    Path(slot): Path<u8>,
) -> Result<Json<u8>, Error> {
    session.recall(slot).await?;
    Ok(Json(slot))
}

pub(crate) async fn save(
    Extension(session): Session,
    Path(slot): Path<u8>,
) -> Result<Json<u8>, Error> {
    session.save(slot).await?;
    Ok(Json(slot))
}
