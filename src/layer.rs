use crate::config::{Settings, TypeSet};
use crate::service::CompressionService;
use std::sync::Arc;
use tower::Layer;

/// A Tower layer that compresses HTTP response bodies with brotli.
///
/// This layer wraps services and compresses eligible response bodies when the
/// client's `Accept-Encoding` header accepts `br`.
#[derive(Debug, Clone)]
pub struct CompressionLayer {
    settings: Arc<Settings>,
}

impl CompressionLayer {
    /// Creates a new compression layer with default settings.
    ///
    /// Compression is enabled for `text/html` responses of at least 20 bytes,
    /// at quality 6 with a 4m window.
    pub fn new() -> Self {
        Self::from_settings(Settings::default())
    }

    /// Creates a layer from resolved settings.
    pub fn from_settings(settings: Settings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }

    /// Sets the encoder quality.
    ///
    /// Values above the maximum quality are clamped.
    pub fn quality(mut self, quality: u32) -> Self {
        Arc::make_mut(&mut self.settings).quality = quality.min(crate::config::MAX_QUALITY);
        self
    }

    /// Sets the minimum response length required for compression.
    ///
    /// Responses with a known Content-Length smaller than this value
    /// will not be compressed.
    pub fn min_length(mut self, length: u64) -> Self {
        Arc::make_mut(&mut self.settings).min_length = length;
        self
    }

    /// Sets the MIME types eligible for compression.
    pub fn types(mut self, types: TypeSet) -> Self {
        Arc::make_mut(&mut self.settings).types = types;
        self
    }

    /// Returns the settings in effect.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

impl Default for CompressionLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for CompressionLayer {
    type Service = CompressionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CompressionService::new(inner, self.settings.clone())
    }
}
