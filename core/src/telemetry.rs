use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ingest_edge=info,runner_container=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Counters for one capture loop, logged when the loop exits.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CaptureStats {
    pub datagrams: u64,
    pub records: u64,
    pub discarded: u64,
    pub bytes: u64,
}
