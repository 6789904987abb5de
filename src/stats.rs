use std::fmt;

/// Byte counters of one compression session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionStats {
    /// Uncompressed bytes consumed by the encoder.
    pub bytes_in: u64,
    /// Compressed bytes taken from the encoder.
    pub bytes_out: u64,
    /// Whether the session finished successfully.
    pub succeeded: bool,
}

impl CompressionStats {
    /// Returns the compression ratio, `bytes_in / bytes_out`.
    ///
    /// Only reported for sessions that succeeded and produced output.
    pub fn ratio(&self) -> Option<Ratio> {
        if !self.succeeded || self.bytes_out == 0 {
            return None;
        }
        Some(Ratio::new(self.bytes_in, self.bytes_out))
    }
}

/// A compression ratio with two decimal places.
///
/// The exact quotient is rounded to hundredths: a remainder above one half
/// rounds up, an exact half rounds down. `1000 / 333` (3.003) displays as
/// `3.00` and `1005 / 1000` (1.005) as `1.00`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ratio {
    hundredths: u128,
}

impl Ratio {
    fn new(bytes_in: u64, bytes_out: u64) -> Self {
        let numerator = u128::from(bytes_in) * 100;
        let denominator = u128::from(bytes_out);

        let mut hundredths = numerator / denominator;
        if (numerator % denominator) * 2 > denominator {
            hundredths += 1;
        }

        Self { hundredths }
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.hundredths / 100, self.hundredths % 100)
    }
}
