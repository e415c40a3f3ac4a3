use tokio::sync::RwLock;
use tracing_subscriber::{prelude::*, EnvFilter};

fn do_init() {
    // Request traces from tower-http are on debug,
    // opt in via RUST_LOG when needed.
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=info".into()),
        )))
        .init();
}

/// Initialize tracing.
///
/// Will only initialize once, so tests may call this.
pub async fn init() {
    static TRACING_IS_INITIALIZED: RwLock<bool> = RwLock::const_new(false);

    let initialized = { *TRACING_IS_INITIALIZED.read().await };

    if !initialized {
        let mut initialized = TRACING_IS_INITIALIZED.write().await;

        // To avoid race condition between the `.read()` and the
        // `.write()`.
        if *initialized {
            return;
        }

        do_init();

        *initialized = true;
    }
}
