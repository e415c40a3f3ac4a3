//! Shared plumbing: a bridge wired to a scripted supply,
//! and request helpers that drive the real router.

use std::{path::PathBuf, sync::Arc};

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use psu_bridge::{
    device::{mock::MockOpener, PortOpener},
    server,
    session::SessionManager,
    settings::SettingsStore,
};
use serde_json::Value;
use tower::ServiceExt;

pub struct TestBridge {
    pub app: Router,
    pub opener: Arc<MockOpener>,
    pub settings_path: PathBuf,

    // Keeps the settings directory alive for the test's duration.
    _dir: tempfile::TempDir,
}

/// A bridge with an any-port supply, already connected.
#[allow(dead_code)]
pub async fn bridge() -> TestBridge {
    let bridge = bridge_with(MockOpener::new()).await;
    let (status, _) = bridge.post("/connect").await;
    assert_eq!(status, StatusCode::OK);
    bridge
}

/// A bridge over the given opener. No connect is attempted.
pub async fn bridge_with(opener: MockOpener) -> TestBridge {
    psu_bridge::logging::init().await;

    let dir = tempfile::tempdir().unwrap();
    let settings_path = dir.path().join("settings.ron");
    let settings = SettingsStore::new(&settings_path);
    let opener = Arc::new(opener);

    let session =
        SessionManager::new(settings, Arc::clone(&opener) as Arc<dyn PortOpener>).unwrap();

    TestBridge {
        app: server::app(session),
        opener,
        settings_path,
        _dir: dir,
    }
}

impl TestBridge {
    pub async fn request(
        &self,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);

        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();

        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };

        (status, value)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.request("GET", uri, None).await
    }

    #[allow(dead_code)]
    pub async fn put(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.request("PUT", uri, Some(body)).await
    }

    pub async fn post(&self, uri: &str) -> (StatusCode, Value) {
        self.request("POST", uri, None).await
    }
}
