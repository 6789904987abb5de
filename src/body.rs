use crate::codec::BrotliParams;
use crate::error::{BoxError, Error};
use crate::session::{Chunk, CompressionSession, Consumer, OutputChunk, Progress};
use crate::stats::CompressionStats;
use bytes::{Buf, Bytes};
use http_body::{Body, Frame};
use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::{Context, Poll};

pin_project! {
    /// A response body that may be compressed.
    ///
    /// This type wraps an inner body and either compresses it with brotli or
    /// passes it through unchanged.
    #[project = CompressionBodyProj]
    #[allow(missing_docs)]
    pub enum CompressionBody<B> {
        /// Compressed body with its session.
        Compressed {
            #[pin]
            inner: B,
            state: CompressedBody,
        },
        /// Passthrough body without compression.
        Passthrough {
            #[pin]
            inner: B,
        },
    }
}

/// State and buffers for an actively compressed body.
pub(crate) struct CompressedBody {
    session: CompressionSession<BrotliParams>,
    slot: FrameSlot,
    always_flush: bool,
    state: CompressState,
    pending_trailers: Option<http::HeaderMap>,
}

/// State machine for the body adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompressState {
    /// Pulling frames from the inner body into the session.
    Reading,
    /// The final chunk was queued; draining the encoder.
    Finishing,
    /// The encoded stream is complete; trailers go out next.
    Trailers,
    /// Nothing left to emit.
    Done,
}

/// Holds at most one output frame between polls.
///
/// Offers are refused while a frame is waiting, which suspends the session
/// until the frame has been yielded.
#[derive(Debug, Default)]
struct FrameSlot {
    frame: Option<Bytes>,
}

impl Consumer for FrameSlot {
    fn offer(&mut self, chunk: OutputChunk<'_>) -> Result<usize, BoxError> {
        if self.frame.is_some() {
            return Ok(0);
        }
        self.frame = Some(Bytes::copy_from_slice(chunk.data));
        Ok(chunk.data.len())
    }
}

impl CompressedBody {
    /// Creates a new compressed body state.
    fn new(params: BrotliParams, size_hint: Option<u64>, always_flush: bool) -> Self {
        Self {
            session: CompressionSession::new(params, size_hint),
            slot: FrameSlot::default(),
            always_flush,
            state: CompressState::Reading,
            pending_trailers: None,
        }
    }

    /// Returns the current compression state.
    pub(crate) fn state(&self) -> CompressState {
        self.state
    }

    /// Returns whether always flush is enabled.
    #[allow(dead_code)]
    pub(crate) fn always_flush(&self) -> bool {
        self.always_flush
    }

    /// Polls the inner body and compresses data.
    fn poll_compressed<B>(
        &mut self,
        cx: &mut Context<'_>,
        mut inner: Pin<&mut B>,
    ) -> Poll<Option<Result<Frame<Bytes>, Error>>>
    where
        B: Body,
        B::Data: Buf,
        B::Error: Into<BoxError>,
    {
        loop {
            if let Some(data) = self.slot.frame.take() {
                return Poll::Ready(Some(Ok(Frame::data(data))));
            }

            match self.state {
                CompressState::Done => return Poll::Ready(None),
                CompressState::Trailers => {
                    self.state = CompressState::Done;
                    return match self.pending_trailers.take() {
                        Some(trailers) => Poll::Ready(Some(Ok(Frame::trailers(trailers)))),
                        None => Poll::Ready(None),
                    };
                }
                CompressState::Reading | CompressState::Finishing => {}
            }

            match self.session.drive(&mut self.slot) {
                Ok(Progress::Finished) => {
                    self.state = if self.pending_trailers.is_some() {
                        CompressState::Trailers
                    } else {
                        CompressState::Done
                    };
                    continue;
                }
                // The slot is full; yield it on the next iteration.
                Ok(Progress::WouldBlock) => continue,
                Ok(Progress::NeedInput) if self.slot.frame.is_some() => continue,
                Ok(Progress::NeedInput) => {}
                Err(e) => {
                    self.state = CompressState::Done;
                    return Poll::Ready(Some(Err(e)));
                }
            }

            if self.state == CompressState::Finishing {
                // The final chunk was fed but the session still wants input.
                self.session.close();
                self.state = CompressState::Done;
                return Poll::Ready(Some(Err(Error::EncoderStalled)));
            }

            let chunk = match inner.as_mut().poll_frame(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    self.state = CompressState::Finishing;
                    Chunk::end()
                }
                Poll::Ready(Some(Err(e))) => {
                    self.session.close();
                    self.state = CompressState::Done;
                    return Poll::Ready(Some(Err(Error::Body(e.into()))));
                }
                Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                    Ok(mut data) => {
                        let data = data.copy_to_bytes(data.remaining());
                        if self.always_flush {
                            Chunk::flush(data)
                        } else {
                            Chunk::data(data)
                        }
                    }
                    Err(frame) => match frame.into_trailers() {
                        Ok(trailers) => {
                            // Trailers end the data; hold them until the encoder finishes.
                            self.pending_trailers = Some(trailers);
                            self.state = CompressState::Finishing;
                            Chunk::end()
                        }
                        Err(_) => continue,
                    },
                },
            };

            if let Err(e) = self.session.push(chunk) {
                self.state = CompressState::Done;
                return Poll::Ready(Some(Err(e)));
            }
        }
    }
}

impl<B> CompressionBody<B> {
    /// Creates a compressed body.
    ///
    /// `size_hint` is the uncompressed length, if known; it is used to pick a
    /// smaller encoder window for short responses.
    pub fn compressed(
        inner: B,
        params: BrotliParams,
        size_hint: Option<u64>,
        always_flush: bool,
    ) -> Self {
        Self::Compressed {
            inner,
            state: CompressedBody::new(params, size_hint, always_flush),
        }
    }

    /// Creates a passthrough body without compression.
    pub fn passthrough(inner: B) -> Self {
        Self::Passthrough { inner }
    }

    /// Returns compression counters, or `None` for a passthrough body.
    ///
    /// [`CompressionStats::ratio`] becomes available once the body has been
    /// fully polled.
    pub fn stats(&self) -> Option<CompressionStats> {
        match self {
            CompressionBody::Compressed { state, .. } => Some(state.session.stats()),
            CompressionBody::Passthrough { .. } => None,
        }
    }
}

impl<B> Body for CompressionBody<B>
where
    B: Body,
    B::Data: Buf,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project() {
            CompressionBodyProj::Passthrough { inner } => match inner.poll_frame(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Ready(Some(Ok(frame))) => {
                    let frame = frame.map_data(|mut data| data.copy_to_bytes(data.remaining()));
                    Poll::Ready(Some(Ok(frame)))
                }
                Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(Error::Body(e.into())))),
            },
            CompressionBodyProj::Compressed { inner, state } => state.poll_compressed(cx, inner),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            CompressionBody::Passthrough { inner } => inner.is_end_stream(),
            CompressionBody::Compressed { state, .. } => {
                state.state() == CompressState::Done && state.slot.frame.is_none()
            }
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        match self {
            CompressionBody::Passthrough { inner } => inner.size_hint(),
            // Compressed size is unknown
            CompressionBody::Compressed { .. } => http_body::SizeHint::default(),
        }
    }
}
