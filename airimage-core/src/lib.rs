//! # AirImage Core
//!
//! A process-wide, three-tier image cache for client applications that show
//! remote images keyed by short identifiers.
//!
//! ## Overview
//!
//! A lookup checks three sources in order and reports the first hit:
//!
//! - **Memory**: decoded images, purged on memory pressure
//! - **Disk**: one JPEG file per key under the cache root
//! - **Network**: the key is turned into a URL by a caller-supplied resolver
//!   and fetched; concurrent lookups of one key share a single download
//!
//! Successful downloads are written back to memory and disk. Completions run
//! on one callback context owned by the cache (or pumped by the caller), and
//! every pending lookup can be cancelled through its [`CancelHandle`].
//!
//! ## Examples
//!
//! ```no_run
//! use airimage_core::{BaseUrlResolver, CacheSettings, ImageCache};
//! use url::Url;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = ImageCache::builder(CacheSettings::default())
//!     .resolver(BaseUrlResolver::new(Url::parse(
//!         "https://img.example.com/avatars/",
//!     )?))
//!     .build()?;
//!
//! let handle = cache.lookup("user-42", |image| match image {
//!     Some(image) => println!("got {:?}", image.dimensions()),
//!     None => println!("no image"),
//! });
//!
//! // The view went away before the image arrived.
//! if let Some(handle) = handle {
//!     handle.cancel();
//! }
//! # Ok(())
//! # }
//! ```

#![allow(missing_docs)]

/// Tiered lookup coordinator and its builder
pub mod cache;

/// Callback context for lookup completions
pub mod completion;

/// On-disk JPEG tier
pub mod disk;

/// Decoded image values and the disk codec
pub mod entry;

/// Error types
pub mod error;

pub mod handle;

/// Cache keys and their on-disk file names
pub mod key;

/// In-memory tier
pub mod memory;

/// Memory-pressure signal and the optional system monitor
pub mod pressure;

/// Key → URL resolution
pub mod resolver;

pub mod settings;

/// One-image holder for views
pub mod slot;

pub mod stats;

/// Network byte fetching
pub mod transport;

pub use cache::{ImageCache, ImageCacheBuilder};
pub use completion::{CallbackContext, CompletionPump};
pub use entry::{ImageCodec, ImageEntry, JpegCodec};
pub use error::{CacheError, CodecError, FetchError, Result, WriteError};
pub use handle::CancelHandle;
pub use key::CacheKey;
pub use pressure::{MemoryPressureSignal, PressureSource};
pub use resolver::{BaseUrlResolver, UrlResolver};
pub use settings::CacheSettings;
pub use slot::ImageSlot;
pub use stats::CacheStats;
pub use transport::{HttpTransport, Transport};
