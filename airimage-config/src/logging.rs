use anyhow::anyhow;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const DEFAULT_FILTER: &str = "info,airimage_core=info";

/// Installs the global subscriber: `RUST_LOG` when set, else `fallback`.
pub fn init_tracing(fallback: &str) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|err| anyhow!("failed to install tracing subscriber: {err}"))
}
