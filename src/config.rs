//! Compression settings.
//!
//! Settings come in two shapes. [`PartialSettings`] holds optional values as
//! they were written at one configuration level and can be merged with the
//! level above it. [`Settings`] is the validated result with every default
//! filled in.

use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::BTreeSet;

/// Lowest brotli quality.
pub const MIN_QUALITY: u32 = 0;
/// Highest brotli quality.
pub const MAX_QUALITY: u32 = 11;
/// Smallest brotli window, in bits (1k).
pub const MIN_WINDOW_BITS: u32 = 10;
/// Largest brotli window, in bits (16m).
pub const MAX_WINDOW_BITS: u32 = 24;

const DEFAULT_QUALITY: u32 = 6;
const DEFAULT_WINDOW_BITS: u32 = 22;
const DEFAULT_MIN_LENGTH: u64 = 20;
const DEFAULT_TYPE: &str = "text/html";

/// How pre-compressed static variants are served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StaticMode {
    /// Never serve static variants.
    #[default]
    Off,
    /// Serve a variant when the client accepts the encoding.
    On,
    /// Serve a variant regardless of `Accept-Encoding`.
    Always,
}

/// A size written either as a plain byte count or as a string with an
/// optional `k` or `m` suffix.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SizeValue {
    /// A byte count.
    Bytes(u64),
    /// A size such as `"512k"`.
    Text(String),
}

impl SizeValue {
    /// Returns the size in bytes.
    pub fn to_bytes(&self) -> Result<u64, ConfigError> {
        match self {
            SizeValue::Bytes(bytes) => Ok(*bytes),
            SizeValue::Text(text) => parse_size(text),
        }
    }
}

/// Settings as written at one configuration level. Unset fields inherit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PartialSettings {
    /// Compress dynamic responses.
    pub enable: Option<bool>,
    /// Serve pre-compressed static variants.
    pub static_mode: Option<StaticMode>,
    /// Encoder quality.
    pub quality: Option<u32>,
    /// Encoder window size in bytes.
    pub window: Option<SizeValue>,
    /// Smallest known response length that is compressed.
    pub min_length: Option<u64>,
    /// MIME types eligible for compression.
    pub types: Option<Vec<String>>,
}

impl PartialSettings {
    /// Fills every unset field of `self` from `parent`.
    pub fn merge(self, parent: &PartialSettings) -> PartialSettings {
        PartialSettings {
            enable: self.enable.or(parent.enable),
            static_mode: self.static_mode.or(parent.static_mode),
            quality: self.quality.or(parent.quality),
            window: self.window.or_else(|| parent.window.clone()),
            min_length: self.min_length.or(parent.min_length),
            types: self.types.or_else(|| parent.types.clone()),
        }
    }

    /// Validates the settings and fills in defaults.
    pub fn resolve(&self) -> Result<Settings, ConfigError> {
        let quality = self.quality.unwrap_or(DEFAULT_QUALITY);
        if !(MIN_QUALITY..=MAX_QUALITY).contains(&quality) {
            return Err(ConfigError::QualityOutOfRange(quality));
        }

        let window_bits = match &self.window {
            Some(window) => window_bits(window.to_bytes()?)?,
            None => DEFAULT_WINDOW_BITS,
        };

        let types = match &self.types {
            Some(types) => TypeSet::new(types.iter().map(String::as_str)),
            None => TypeSet::default(),
        };

        Ok(Settings {
            enable: self.enable.unwrap_or(false),
            static_mode: self.static_mode.unwrap_or_default(),
            quality,
            window_bits,
            min_length: self.min_length.unwrap_or(DEFAULT_MIN_LENGTH),
            types,
        })
    }
}

/// Validated compression settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Compress dynamic responses.
    pub enable: bool,
    /// Serve pre-compressed static variants.
    pub static_mode: StaticMode,
    /// Encoder quality, within `MIN_QUALITY..=MAX_QUALITY`.
    pub quality: u32,
    /// Encoder window, as log2 of its size in bytes.
    pub window_bits: u32,
    /// Smallest known response length that is compressed.
    pub min_length: u64,
    /// MIME types eligible for compression.
    pub types: TypeSet,
}

/// Compression enabled, everything else at its resolved default.
impl Default for Settings {
    fn default() -> Self {
        Self {
            enable: true,
            static_mode: StaticMode::Off,
            quality: DEFAULT_QUALITY,
            window_bits: DEFAULT_WINDOW_BITS,
            min_length: DEFAULT_MIN_LENGTH,
            types: TypeSet::default(),
        }
    }
}

/// A set of MIME types matched against a response `Content-Type`.
///
/// `text/html` is always a member. The entry `*` matches every type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSet {
    any: bool,
    types: BTreeSet<String>,
}

impl TypeSet {
    /// Builds a set from MIME type names.
    pub fn new<'a>(types: impl IntoIterator<Item = &'a str>) -> Self {
        let mut set = TypeSet::default();
        for ty in types {
            let ty = ty.trim();
            if ty == "*" {
                set.any = true;
            } else {
                set.types.insert(ty.to_ascii_lowercase());
            }
        }
        set
    }

    /// Returns a set that matches every type.
    pub fn any() -> Self {
        Self {
            any: true,
            ..Self::default()
        }
    }

    /// Tests a `Content-Type` value, ignoring its parameters.
    pub fn matches(&self, content_type: &str) -> bool {
        if self.any {
            return true;
        }
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        self.types.contains(&essence)
    }
}

impl Default for TypeSet {
    fn default() -> Self {
        Self {
            any: false,
            types: BTreeSet::from([DEFAULT_TYPE.to_owned()]),
        }
    }
}

/// Converts a window size in bytes to window bits.
///
/// Only exact powers of two between 1k and 16m are accepted.
pub fn window_bits(size: u64) -> Result<u32, ConfigError> {
    (MIN_WINDOW_BITS..=MAX_WINDOW_BITS)
        .find(|bits| size == 1u64 << bits)
        .ok_or(ConfigError::InvalidWindow(size))
}

/// Parses `N`, `Nk` or `Nm` (suffix case insensitive) into bytes.
pub fn parse_size(text: &str) -> Result<u64, ConfigError> {
    let invalid = || ConfigError::InvalidSize(text.to_owned());
    let trimmed = text.trim();

    let (digits, scale) = match trimmed.as_bytes().last() {
        Some(b'k' | b'K') => (&trimmed[..trimmed.len() - 1], 1024),
        Some(b'm' | b'M') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        _ => (trimmed, 1),
    };

    digits
        .parse::<u64>()
        .map_err(|_| invalid())?
        .checked_mul(scale)
        .ok_or_else(invalid)
}
