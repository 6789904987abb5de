//! Brotli response compression for Tower.
//!
//! This crate compresses HTTP response bodies with brotli when the client's
//! `Accept-Encoding` header accepts `br`, and can answer static file requests
//! with pre-compressed `.br` siblings instead.
//!
//! # Example
//!
//! ```ignore
//! use http_brotli_compression::CompressionLayer;
//! use tower::ServiceBuilder;
//!
//! let service = ServiceBuilder::new()
//!     .layer(CompressionLayer::new().quality(5))
//!     .service(my_service);
//! ```
//!
//! Settings can also be loaded from configuration, merged per level and
//! resolved once at startup:
//!
//! ```ignore
//! use http_brotli_compression::{CompressionLayer, PartialSettings};
//!
//! let server: PartialSettings = toml::from_str(server_toml)?;
//! let location: PartialSettings = toml::from_str(location_toml)?;
//! let layer = CompressionLayer::from_settings(location.merge(&server).resolve()?);
//! ```
//!
//! # Compression Rules
//!
//! The middleware will **not** compress responses when:
//! - Compression is disabled in the settings
//! - The status is not `200`, `403` or `404`
//! - The request method is `HEAD`
//! - `Accept-Encoding` does not accept `br`, or accepts it with `q=0`
//! - A non-empty `Content-Encoding` header is already set
//! - `Content-Range` header is present (range responses)
//! - `Content-Length` is below the minimum length (default: 20 bytes)
//! - `Content-Type` is not one of the configured types (default: `text/html`)
//!
//! The middleware will **always flush** after each chunk when:
//! - `X-Accel-Buffering: no` header is present
//! - `Content-Type` is `text/event-stream`
//! - `Content-Type` starts with `application/grpc-web`
//!
//! # Response Modifications
//!
//! `Vary` gains `Accept-Encoding` for every eligible response, compressed or
//! not. When compression is applied:
//! - `Content-Encoding` is set to `br`
//! - `Content-Length` header is removed (compressed size is unknown)
//! - `Accept-Ranges` header is removed
//! - A strong `ETag` is made weak
//!
//! # Static Variants
//!
//! [`StaticVariantSelector`] maps a `GET` or `HEAD` request for `/app.js` to
//! `app.js.br` on disk and builds a response that serves it unchanged, with
//! the content type of `app.js`. Build it with
//! [`StaticVariantSelector::from_settings`] to follow the configured
//! [`StaticMode`].
//!
//! Placed behind [`CompressionLayer`], a selector in [`StaticMode::On`] that
//! declines still marks the request through its [`VaryHandle`], so the
//! response carries `Vary: Accept-Encoding` whichever way it is served.

#![deny(missing_docs)]

mod body;
pub mod codec;
pub mod config;
mod error;
mod future;
mod layer;
pub mod negotiate;
mod service;
pub mod session;
pub mod static_variant;
mod stats;

pub use body::CompressionBody;
pub use config::{PartialSettings, Settings, StaticMode, TypeSet};
pub use error::{BoxError, ConfigError, Error, OpenError, OpenErrorKind, Result};
pub use future::ResponseFuture;
pub use layer::CompressionLayer;
pub use negotiate::{Negotiated, VaryHandle, is_encoding_acceptable};
pub use service::CompressionService;
pub use static_variant::{Selection, StaticVariant, StaticVariantSelector};
pub use stats::{CompressionStats, Ratio};
