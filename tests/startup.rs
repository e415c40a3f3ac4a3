//! First boot: no settings file exists at all, yet after one connect
//! the bridge is talking to the supply on the templated default port.

mod common;

use axum::http::StatusCode;
use common::bridge_with;
use pretty_assertions::assert_eq;
use psu_bridge::device::mock::MockOpener;
use psu_bridge::settings::{COM_PORT_KEY, SECTION, SettingsStore};
use serde_json::json;

#[tokio::test]
async fn fresh_host_connects_on_the_default_port() {
    // The supply is reachable on COM3 and nowhere else.
    let bridge = bridge_with(MockOpener::accepting("COM3")).await;

    // Creating the session wrote the template.
    let store = SettingsStore::new(&bridge.settings_path);
    assert_eq!(store.read(SECTION, COM_PORT_KEY).unwrap(), "COM3");

    let (status, body) = bridge.post("/connect").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!("fresh"));

    let (_, body) = bridge.get("/status").await;
    assert_eq!(body, json!({ "port": "COM3", "connected": true }));
}

#[tokio::test]
async fn connecting_to_an_absent_supply_is_descriptive() {
    let bridge = bridge_with(MockOpener::accepting("/dev/ttyUSB0")).await;

    let (status, body) = bridge.post("/connect").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("Could not connect to `COM3`"));

    // An explicit port change brings it up.
    let (status, body) = bridge.put("/port", json!({ "port": "/dev/ttyUSB0" })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["connect"], json!({ "Ok": "fresh" }));
}
