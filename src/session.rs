//! The per-response compression state machine.
//!
//! A [`CompressionSession`] owns one encoder and drives it over queued input
//! chunks, handing output to a [`Consumer`] one extent at a time. The session
//! never blocks: when the consumer cannot take more output, or when there is
//! no input left to feed, [`drive`] returns and the caller resumes the same
//! session later.
//!
//! Each pass through the driving loop picks the first applicable step:
//!
//! 1. hand a staged output extent to the consumer; the encoder is not touched
//!    again until that extent is fully drained
//! 2. take the next output extent from the encoder and stage it
//! 3. stop if the encoder has finished
//! 4. ask the encoder to finish if the last input chunk was fed
//! 5. wait for input if none is queued
//! 6. feed the head of the input queue
//!
//! [`drive`]: CompressionSession::drive

use crate::codec::{EncoderFactory, IncrementalEncoder, Operation};
use crate::error::{BoxError, Error};
use crate::stats::CompressionStats;
use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::io;

/// A chunk of uncompressed input with its stream markers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chunk {
    data: Bytes,
    last: bool,
    flush: bool,
}

impl Chunk {
    /// A plain data chunk.
    pub fn data(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            last: false,
            flush: false,
        }
    }

    /// A chunk after which all buffered output must be emitted.
    pub fn flush(data: impl Into<Bytes>) -> Self {
        Self {
            flush: true,
            ..Self::data(data)
        }
    }

    /// The final chunk of the stream.
    pub fn last(data: impl Into<Bytes>) -> Self {
        Self {
            last: true,
            ..Self::data(data)
        }
    }

    /// An empty final chunk.
    pub fn end() -> Self {
        Self::last(Bytes::new())
    }

    /// Returns the chunk's data.
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    /// Returns `true` if this is the final chunk.
    pub fn is_last(&self) -> bool {
        self.last
    }

    /// Returns `true` if this chunk is a flush boundary.
    pub fn is_flush(&self) -> bool {
        self.flush
    }

    fn operation(&self) -> Operation {
        if self.last {
            Operation::Finish
        } else if self.flush {
            Operation::Flush
        } else {
            Operation::Process
        }
    }
}

/// A view of encoded output offered to a [`Consumer`].
///
/// `data` borrows memory owned by the encoder. It is only valid for the
/// duration of [`Consumer::offer`]; consumers that keep it must copy it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputChunk<'a> {
    /// Encoded bytes not yet accepted.
    pub data: &'a [u8],
    /// This extent ends the encoded stream.
    pub last: bool,
    /// This extent ends a flush boundary.
    pub flush: bool,
}

/// Downstream receiver of encoded output.
pub trait Consumer {
    /// Offers `chunk` and returns how many bytes of it were accepted.
    ///
    /// Returning less than `chunk.data.len()` leaves the rest staged; returning
    /// zero means no progress is possible now and the session suspends. An
    /// error is a hard failure and closes the session.
    fn offer(&mut self, chunk: OutputChunk<'_>) -> Result<usize, BoxError>;
}

/// Accepts everything by appending it.
impl Consumer for Vec<u8> {
    fn offer(&mut self, chunk: OutputChunk<'_>) -> Result<usize, BoxError> {
        self.extend_from_slice(chunk.data);
        Ok(chunk.data.len())
    }
}

/// Lifecycle of a [`CompressionSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No encoder has been opened yet.
    Uninitialized,
    /// The encoder is open.
    Active,
    /// The stream was fully encoded and drained.
    Finished,
    /// The session failed or was aborted.
    Failed,
}

/// Why [`CompressionSession::drive`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The encoded stream is complete.
    Finished,
    /// The consumer accepted nothing; retry once it can make progress.
    WouldBlock,
    /// All queued input was fed; push more input or the final chunk.
    NeedInput,
}

/// Position and markers of the staged output extent.
#[derive(Debug, Default)]
struct Staged {
    pos: usize,
    last: bool,
    flush: bool,
}

/// State for compressing one response body.
pub struct CompressionSession<F: EncoderFactory> {
    factory: F,
    size_hint: Option<u64>,
    encoder: Option<F::Encoder>,
    input: VecDeque<Chunk>,
    staged: Staged,
    state: SessionState,
    bytes_in: u64,
    bytes_out: u64,
    output_ready: bool,
    output_busy: bool,
    end_of_input: bool,
    end_of_block: bool,
}

impl<F: EncoderFactory> CompressionSession<F> {
    /// Creates a session. The encoder is opened on the first [`drive`].
    ///
    /// `size_hint` is the uncompressed length, if known.
    ///
    /// [`drive`]: CompressionSession::drive
    pub fn new(factory: F, size_hint: Option<u64>) -> Self {
        Self {
            factory,
            size_hint,
            encoder: None,
            input: VecDeque::new(),
            staged: Staged::default(),
            state: SessionState::Uninitialized,
            bytes_in: 0,
            bytes_out: 0,
            output_ready: false,
            output_busy: false,
            end_of_input: false,
            end_of_block: false,
        }
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns `true` once the session finished or failed.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, SessionState::Finished | SessionState::Failed)
    }

    /// Returns `true` while input is queued or output is staged.
    pub fn has_pending_output(&self) -> bool {
        self.output_ready || self.output_busy || !self.input.is_empty()
    }

    /// Returns the byte counters.
    pub fn stats(&self) -> CompressionStats {
        CompressionStats {
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
            succeeded: self.state == SessionState::Finished,
        }
    }

    /// Queues an input chunk.
    pub fn push(&mut self, chunk: Chunk) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        self.input.push_back(chunk);
        Ok(())
    }

    /// Drives the encoder until the stream finishes or must suspend.
    ///
    /// Any error closes the session and releases the encoder. Driving a
    /// finished session returns [`Progress::Finished`] again.
    pub fn drive<C>(&mut self, consumer: &mut C) -> Result<Progress, Error>
    where
        C: Consumer + ?Sized,
    {
        match self.state {
            SessionState::Finished => return Ok(Progress::Finished),
            SessionState::Failed => return Err(Error::SessionClosed),
            SessionState::Uninitialized => self.initialize()?,
            SessionState::Active => {}
        }

        match self.run(consumer) {
            Ok(Progress::Finished) => {
                self.state = SessionState::Finished;
                self.release();

                let stats = self.stats();
                tracing::debug!(
                    bytes_in = stats.bytes_in,
                    bytes_out = stats.bytes_out,
                    ratio = stats.ratio().map(tracing::field::display),
                    "brotli stream finished"
                );
                Ok(Progress::Finished)
            }
            Ok(progress) => Ok(progress),
            Err(err) => {
                match &err {
                    Error::Consumer(source) => {
                        tracing::debug!(error = %source, "brotli output rejected")
                    }
                    Error::Codec(source) => {
                        tracing::error!(error = %source, "brotli encoder failed")
                    }
                    _ => tracing::error!(error = %err, "brotli compression failed"),
                }
                self.state = SessionState::Failed;
                self.release();
                Err(err)
            }
        }
    }

    /// Closes the session, releasing the encoder.
    ///
    /// Safe to call in any state and any number of times. Closing a session
    /// that has not finished marks it failed.
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.state = SessionState::Failed;
        self.release();
    }

    fn initialize(&mut self) -> Result<(), Error> {
        match self.factory.open(self.size_hint) {
            Ok(encoder) => {
                self.encoder = Some(encoder);
                self.state = SessionState::Active;
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to open brotli encoder");
                self.state = SessionState::Failed;
                self.release();
                Err(Error::Codec(err))
            }
        }
    }

    fn release(&mut self) {
        self.encoder = None;
        self.input.clear();
        self.output_ready = false;
        self.output_busy = false;
    }

    fn run<C>(&mut self, consumer: &mut C) -> Result<Progress, Error>
    where
        C: Consumer + ?Sized,
    {
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(Error::SessionClosed);
        };

        loop {
            if self.output_ready || self.output_busy {
                let view = &encoder.output()[self.staged.pos..];
                let remaining = view.len();

                let accepted = consumer
                    .offer(OutputChunk {
                        data: view,
                        last: self.staged.last,
                        flush: self.staged.flush,
                    })
                    .map_err(Error::Consumer)?
                    .min(remaining);

                self.output_ready = false;
                self.staged.pos += accepted;

                if accepted == remaining {
                    self.output_busy = false;
                    continue;
                }
                self.output_busy = true;
                if accepted == 0 {
                    return Ok(Progress::WouldBlock);
                }
                continue;
            }

            if encoder.has_more_output() {
                let len = encoder.take_output().len();
                if len == 0 {
                    return Err(Error::Codec(io::Error::other(
                        "encoder reported pending output but returned none",
                    )));
                }
                self.bytes_out += len as u64;

                let last = self.end_of_input && encoder.is_finished();
                self.staged = Staged {
                    pos: 0,
                    last,
                    flush: !last && self.end_of_block,
                };
                self.end_of_block = false;
                self.output_ready = true;

                tracing::trace!(len, last, "brotli out");
                continue;
            }

            if encoder.is_finished() {
                return Ok(Progress::Finished);
            }

            if self.end_of_input {
                encoder
                    .compress(Operation::Finish, &[])
                    .map_err(Error::Codec)?;
                if !encoder.has_more_output() && !encoder.is_finished() {
                    return Err(Error::EncoderStalled);
                }
                continue;
            }

            let Some(chunk) = self.input.front_mut() else {
                return Ok(Progress::NeedInput);
            };

            if chunk.data.is_empty() && !chunk.last && !chunk.flush {
                self.input.pop_front();
                continue;
            }

            let consumed = encoder
                .compress(chunk.operation(), &chunk.data)
                .map_err(Error::Codec)?
                .min(chunk.data.len());
            self.bytes_in += consumed as u64;
            chunk.data.advance(consumed);

            if chunk.data.is_empty() {
                if chunk.last {
                    self.end_of_input = true;
                } else if chunk.flush {
                    // A flush with nothing buffered leaves no block to mark.
                    self.end_of_block = encoder.has_more_output();
                }
                self.input.pop_front();
                continue;
            }

            if consumed == 0 && !encoder.has_more_output() {
                return Err(Error::EncoderStalled);
            }
        }
    }
}
