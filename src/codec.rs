//! The incremental encoder seam and its brotli implementation.
//!
//! A session only talks to [`IncrementalEncoder`] and [`EncoderFactory`];
//! [`BrotliParams`] opens [`BrotliStreamEncoder`]s backed by
//! `compression-codecs`.

use crate::config::{MAX_WINDOW_BITS, MIN_WINDOW_BITS, Settings};
use compression_codecs::{
    EncodeV2,
    brotli::{BrotliEncoder, params::EncoderParams},
};
use compression_core::{
    Level,
    util::{PartialBuffer, WriteBuffer},
};
use std::io;
use std::ops::Range;

/// Spare output space made available to the encoder per call.
const OUTPUT_CHUNK_SIZE: usize = 8 * 1024; // 8KB

/// What the encoder should do after consuming input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Consume input, emitting output whenever the encoder chooses to.
    Process,
    /// Consume input, then emit everything buffered without ending the stream.
    Flush,
    /// Consume input, then end the stream.
    Finish,
}

/// A stateful encoder driven one call at a time.
///
/// Output is kept in memory owned by the encoder. [`take_output`] hands out a
/// view of the next ready extent; that view (also reachable through
/// [`output`]) stays valid until the next call to `take_output` or `compress`.
///
/// [`take_output`]: IncrementalEncoder::take_output
/// [`output`]: IncrementalEncoder::output
pub trait IncrementalEncoder {
    /// Feeds `input` and returns how many bytes were consumed.
    ///
    /// `op` only takes effect once all of `input` has been consumed. Callers
    /// must take all pending output before calling this again.
    fn compress(&mut self, op: Operation, input: &[u8]) -> io::Result<usize>;

    /// Returns `true` if output is waiting to be taken.
    fn has_more_output(&self) -> bool;

    /// Takes the next ready extent of output.
    fn take_output(&mut self) -> &[u8];

    /// Returns the extent handed out by the last [`take_output`] call.
    ///
    /// [`take_output`]: IncrementalEncoder::take_output
    fn output(&self) -> &[u8];

    /// Returns `true` once the stream has ended and all output was taken.
    fn is_finished(&self) -> bool;
}

/// Creates encoders for compression sessions.
pub trait EncoderFactory {
    /// The encoder type produced.
    type Encoder: IncrementalEncoder;

    /// Opens a new encoder. `size_hint` is the response length, if known.
    fn open(&self, size_hint: Option<u64>) -> io::Result<Self::Encoder>;
}

/// Brotli encoder parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrotliParams {
    quality: u32,
    window_bits: u32,
}

impl BrotliParams {
    /// Creates parameters from a quality and a maximum window, in bits.
    pub fn new(quality: u32, window_bits: u32) -> Self {
        Self {
            quality,
            window_bits,
        }
    }

    /// Returns the configured quality.
    pub fn quality(&self) -> u32 {
        self.quality
    }

    /// Returns the configured maximum window, in bits.
    pub fn window_bits(&self) -> u32 {
        self.window_bits
    }
}

impl From<&Settings> for BrotliParams {
    fn from(settings: &Settings) -> Self {
        Self::new(settings.quality, settings.window_bits)
    }
}

impl EncoderFactory for BrotliParams {
    type Encoder = BrotliStreamEncoder;

    fn open(&self, size_hint: Option<u64>) -> io::Result<BrotliStreamEncoder> {
        let window_bits = tune_window_bits(size_hint, self.window_bits);

        tracing::debug!(
            quality = self.quality,
            window_bits,
            size_hint,
            "brotli encoder initialized"
        );

        let params = EncoderParams::default()
            .quality(Level::Precise(self.quality as i32))
            .window_size(window_bits as i32);
        Ok(BrotliStreamEncoder::new(BrotliEncoder::new(params)))
    }
}

/// Picks the window for a response of known length.
///
/// The smallest window that still covers `content_length` is used, capped at
/// `configured`. Unknown, empty and oversized lengths use `configured`.
pub fn tune_window_bits(content_length: Option<u64>, configured: u32) -> u32 {
    let bits = match content_length {
        Some(len) if len > 0 && len <= 1u64 << MAX_WINDOW_BITS => (MIN_WINDOW_BITS
            ..MAX_WINDOW_BITS)
            .find(|bits| 1u64 << bits >= len)
            .unwrap_or(MAX_WINDOW_BITS)
            .min(configured),
        _ => configured,
    };
    bits.clamp(MIN_WINDOW_BITS, MAX_WINDOW_BITS)
}

/// [`IncrementalEncoder`] backed by the brotli codec.
pub struct BrotliStreamEncoder {
    encoder: BrotliEncoder,
    buffer: Vec<u8>,
    filled: usize,
    taken: Range<usize>,
    finished: bool,
}

impl BrotliStreamEncoder {
    fn new(encoder: BrotliEncoder) -> Self {
        Self {
            encoder,
            buffer: vec![0u8; OUTPUT_CHUNK_SIZE],
            filled: 0,
            taken: 0..0,
            finished: false,
        }
    }

    /// Drops output that has been taken so its space can be reused.
    fn reclaim(&mut self) {
        if self.taken.end == self.filled {
            self.filled = 0;
            self.taken = 0..0;
        }
    }

    fn reserve(&mut self) {
        if self.buffer.len() - self.filled < OUTPUT_CHUNK_SIZE {
            self.buffer.resize(self.filled + OUTPUT_CHUNK_SIZE, 0);
        }
    }

    /// Runs flush or finish until the encoder reports it is done.
    fn complete(&mut self, op: Operation) -> io::Result<()> {
        loop {
            self.reserve();
            let mut output = WriteBuffer::new_initialized(&mut self.buffer[self.filled..]);

            let done = match op {
                Operation::Process => Ok(true),
                Operation::Flush => self.encoder.flush(&mut output),
                Operation::Finish => self.encoder.finish(&mut output),
            }
            .map_err(io::Error::other)?;

            self.filled += output.written_len();
            if done {
                break;
            }
        }

        if op == Operation::Finish {
            self.finished = true;
        }
        Ok(())
    }
}

impl IncrementalEncoder for BrotliStreamEncoder {
    fn compress(&mut self, op: Operation, input: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Ok(0);
        }
        self.reclaim();

        let mut consumed = 0;
        if !input.is_empty() {
            self.reserve();
            let mut input_buf = PartialBuffer::new(input);
            let mut output = WriteBuffer::new_initialized(&mut self.buffer[self.filled..]);

            self.encoder
                .encode(&mut input_buf, &mut output)
                .map_err(io::Error::other)?;

            consumed = input_buf.written_len();
            self.filled += output.written_len();
        }

        if consumed == input.len() && op != Operation::Process {
            self.complete(op)?;
        }
        Ok(consumed)
    }

    fn has_more_output(&self) -> bool {
        self.taken.end < self.filled
    }

    fn take_output(&mut self) -> &[u8] {
        self.taken = self.taken.end..self.filled;
        &self.buffer[self.taken.clone()]
    }

    fn output(&self) -> &[u8] {
        &self.buffer[self.taken.clone()]
    }

    fn is_finished(&self) -> bool {
        self.finished && !self.has_more_output()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn decode(data: &[u8]) -> Vec<u8> {
        let mut decoded = Vec::new();
        brotli::Decompressor::new(data, 4096)
            .read_to_end(&mut decoded)
            .unwrap();
        decoded
    }

    fn drain(encoder: &mut BrotliStreamEncoder, out: &mut Vec<u8>) {
        while encoder.has_more_output() {
            out.extend_from_slice(encoder.take_output());
        }
    }

    #[test]
    fn test_tune_window_bits() {
        assert_eq!(tune_window_bits(None, 22), 22);
        assert_eq!(tune_window_bits(Some(0), 22), 22);
        assert_eq!(tune_window_bits(Some(1), 22), 10);
        assert_eq!(tune_window_bits(Some(1024), 22), 10);
        assert_eq!(tune_window_bits(Some(1025), 22), 11);
        assert_eq!(tune_window_bits(Some(300_000), 22), 19);
        // Capped at the configured window.
        assert_eq!(tune_window_bits(Some(300_000), 16), 16);
        assert_eq!(tune_window_bits(Some(1 << 24), 24), 24);
        assert_eq!(tune_window_bits(Some((1 << 24) + 1), 20), 20);
    }

    #[test]
    fn test_params_from_settings() {
        let settings = Settings {
            quality: 9,
            window_bits: 18,
            ..Settings::default()
        };
        let params = BrotliParams::from(&settings);
        assert_eq!(params.quality(), 9);
        assert_eq!(params.window_bits(), 18);
    }

    #[test]
    fn test_process_then_finish() {
        let mut encoder = BrotliParams::new(6, 22).open(None).unwrap();
        let input = b"hello hello hello hello world".repeat(50);

        let consumed = encoder.compress(Operation::Process, &input).unwrap();
        assert_eq!(consumed, input.len());
        assert!(!encoder.is_finished());

        let mut out = Vec::new();
        drain(&mut encoder, &mut out);
        encoder.compress(Operation::Finish, &[]).unwrap();
        drain(&mut encoder, &mut out);

        assert!(encoder.is_finished());
        assert_eq!(decode(&out), input);
    }

    #[test]
    fn test_flush_emits_output() {
        let mut encoder = BrotliParams::new(6, 22).open(Some(100)).unwrap();

        encoder.compress(Operation::Flush, b"event: ping\n\n").unwrap();
        assert!(encoder.has_more_output());

        let taken = encoder.take_output().to_vec();
        assert!(!taken.is_empty());
        assert_eq!(encoder.output(), taken.as_slice());
        assert!(!encoder.has_more_output());
        assert!(!encoder.is_finished());
    }

    #[test]
    fn test_finish_is_idempotent() {
        let mut encoder = BrotliParams::new(1, 10).open(Some(5)).unwrap();
        encoder.compress(Operation::Finish, b"tiny").unwrap();
        let mut out = Vec::new();
        drain(&mut encoder, &mut out);
        assert!(encoder.is_finished());

        assert_eq!(encoder.compress(Operation::Finish, &[]).unwrap(), 0);
        assert!(!encoder.has_more_output());
        assert_eq!(decode(&out), b"tiny");
    }
}
