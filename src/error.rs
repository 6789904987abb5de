use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Boxed error type used for errors coming from the wrapped body or the
/// downstream consumer.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised while compressing a response or selecting a static variant.
///
/// Declines (the feature does not apply) are never reported through this
/// type; they are plain values such as [`Selection::Declined`].
///
/// [`Selection::Declined`]: crate::static_variant::Selection::Declined
#[derive(Debug, Error)]
pub enum Error {
    /// An encoder operation failed. The session that raised it is closed.
    #[error("brotli encoder failed")]
    Codec(#[source] io::Error),

    /// The encoder neither consumed input nor produced output.
    #[error("brotli encoder made no progress")]
    EncoderStalled,

    /// The downstream consumer rejected output with a hard failure.
    #[error("downstream consumer failed")]
    Consumer(#[source] BoxError),

    /// The wrapped response body yielded an error.
    #[error("response body failed")]
    Body(#[source] BoxError),

    /// The session already failed and can no longer accept work.
    #[error("compression session is closed")]
    SessionClosed,

    /// A request path could not be mapped onto the filesystem.
    #[error("cannot map request path {0:?} to a file")]
    PathMapping(String),
}

/// Configuration validation errors, raised when settings are resolved.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Quality is outside the range supported by the encoder.
    #[error("brotli quality {0} is out of range ({min}..={max})", min = crate::config::MIN_QUALITY, max = crate::config::MAX_QUALITY)]
    QualityOutOfRange(u32),

    /// Window is not one of the supported powers of two.
    #[error("invalid brotli window {0}, must be 1k, 2k, 4k, 8k, 16k, 32k, 64k, 128k, 256k, 512k, 1m, 2m, 4m, 8m or 16m")]
    InvalidWindow(u64),

    /// A size value could not be parsed.
    #[error("invalid size value {0:?}")]
    InvalidSize(String),
}

/// Why a file could not be opened through a [`FileCache`].
///
/// [`FileCache`]: crate::static_variant::FileCache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenErrorKind {
    /// The file or one of its parents does not exist.
    NotFound,
    /// Access was denied.
    PermissionDenied,
    /// Symbolic link resolution failed.
    TooManySymlinks,
    /// Any other failure.
    Other,
}

/// A failed [`FileCache::open_cached`] call.
///
/// [`FileCache::open_cached`]: crate::static_variant::FileCache::open_cached
#[derive(Debug, Error)]
#[error("cannot open {path:?}")]
pub struct OpenError {
    /// Classified cause.
    pub kind: OpenErrorKind,
    /// The path that was opened.
    pub path: PathBuf,
    /// The underlying error.
    #[source]
    pub source: io::Error,
}

impl OpenError {
    /// Classifies an I/O error raised while opening `path`.
    pub fn new(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let kind = match source.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => OpenErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => OpenErrorKind::PermissionDenied,
            io::ErrorKind::TooManyLinks => OpenErrorKind::TooManySymlinks,
            _ => OpenErrorKind::Other,
        };
        Self {
            kind,
            path: path.into(),
            source,
        }
    }
}

/// Result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_kinds() {
        let kind = |kind: io::ErrorKind| OpenError::new("/x.br", io::Error::from(kind)).kind;

        assert_eq!(kind(io::ErrorKind::NotFound), OpenErrorKind::NotFound);
        assert_eq!(kind(io::ErrorKind::NotADirectory), OpenErrorKind::NotFound);
        assert_eq!(
            kind(io::ErrorKind::PermissionDenied),
            OpenErrorKind::PermissionDenied
        );
        assert_eq!(
            kind(io::ErrorKind::TooManyLinks),
            OpenErrorKind::TooManySymlinks
        );
        assert_eq!(kind(io::ErrorKind::Interrupted), OpenErrorKind::Other);
    }

    #[test]
    fn test_wrapped_cause_is_only_a_source() {
        use std::error::Error as _;

        let err = Error::Codec(io::Error::other("window too small"));
        assert_eq!(err.to_string(), "brotli encoder failed");
        assert_eq!(err.source().unwrap().to_string(), "window too small");

        let err = Error::Consumer("connection reset".into());
        assert_eq!(err.to_string(), "downstream consumer failed");
        assert_eq!(err.source().unwrap().to_string(), "connection reset");

        let err = Error::Body("truncated".into());
        assert_eq!(err.to_string(), "response body failed");
        assert_eq!(err.source().unwrap().to_string(), "truncated");

        let err = OpenError::new("/x.br", io::Error::other("disk gone"));
        assert_eq!(err.to_string(), "cannot open \"/x.br\"");
        assert_eq!(err.source().unwrap().to_string(), "disk gone");
    }

    #[test]
    fn test_quality_message_names_range() {
        assert_eq!(
            ConfigError::QualityOutOfRange(12).to_string(),
            "brotli quality 12 is out of range (0..=11)"
        );
    }
}
