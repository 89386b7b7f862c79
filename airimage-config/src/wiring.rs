use airimage_core::{BaseUrlResolver, CompletionPump, ImageCache};
use anyhow::Context;
use tracing::info;

use crate::models::AirImageConfig;

/// Builds the cache described by `config` on the current tokio runtime.
///
/// The pump is `Some` when the configuration asks for a manual callback
/// context; the application must drain it on its UI thread.
pub fn build_cache(
    config: &AirImageConfig,
) -> anyhow::Result<(ImageCache, Option<CompletionPump>)> {
    let mut builder = ImageCache::builder(config.cache.clone());
    if let Some(base) = &config.base_url {
        builder = builder.resolver(BaseUrlResolver::new(base.clone()));
    }

    let (cache, pump) = builder
        .build_in(config.callback_context)
        .context("failed to build image cache")?;

    info!(
        cache_root = ?cache.disk().root(),
        base_url = config.base_url.as_ref().map(|url| url.as_str()),
        callback_context = ?config.callback_context,
        "image cache ready"
    );
    Ok((cache, pump))
}
