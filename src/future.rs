use crate::body::CompressionBody;
use crate::codec::BrotliParams;
use crate::config::Settings;
use crate::negotiate::{ENCODING, VaryHandle};
use http::{Response, StatusCode, header};
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

pin_project! {
    /// Future for compression service responses.
    pub struct ResponseFuture<F> {
        #[pin]
        inner: F,
        accepted: bool,
        head: bool,
        settings: Arc<Settings>,
        vary: VaryHandle,
    }
}

impl<F> ResponseFuture<F> {
    pub(crate) fn new(
        inner: F,
        accepted: bool,
        head: bool,
        settings: Arc<Settings>,
        vary: VaryHandle,
    ) -> Self {
        Self {
            inner,
            accepted,
            head,
            settings,
            vary,
        }
    }
}

impl<F, B, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<Response<B>, E>>,
{
    type Output = Result<Response<CompressionBody<B>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        match this.inner.poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(response)) => {
                let mut response =
                    wrap_response(response, *this.accepted, *this.head, this.settings);
                // An inner stage negotiated on this request and declined.
                if this.vary.is_set() {
                    add_vary_accept_encoding(response.headers_mut());
                }
                Poll::Ready(Ok(response))
            }
        }
    }
}

/// Wraps the response body with compression if appropriate.
///
/// A response whose headers make it eligible always gets
/// `Vary: accept-encoding`, even when the client declined brotli.
fn wrap_response<B>(
    response: Response<B>,
    accepted: bool,
    head: bool,
    settings: &Settings,
) -> Response<CompressionBody<B>> {
    let (mut parts, body) = response.into_parts();

    let eligible = settings.enable
        && matches!(
            parts.status,
            StatusCode::OK | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND
        )
        && !head
        && !has_content_encoding(&parts.headers)
        && !has_content_range(&parts.headers)
        && !is_below_min_length(&parts.headers, settings.min_length)
        && settings.types.matches(content_type(&parts.headers));

    if !eligible {
        return Response::from_parts(parts, CompressionBody::passthrough(body));
    }

    add_vary_accept_encoding(&mut parts.headers);

    if !accepted {
        tracing::debug!("client does not accept {ENCODING}, passing response through");
        return Response::from_parts(parts, CompressionBody::passthrough(body));
    }

    // Check for x-accel-buffering: no header or streaming content types
    let always_flush = parts
        .headers
        .get("x-accel-buffering")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("no"))
        || is_streaming_content_type(&parts.headers);

    let size_hint = content_length(&parts.headers);

    parts.headers.insert(
        header::CONTENT_ENCODING,
        header::HeaderValue::from_static(ENCODING),
    );

    // Remove Content-Length since compressed size is unknown
    parts.headers.remove(header::CONTENT_LENGTH);

    // Remove Accept-Ranges since we can't support ranges on compressed content
    parts.headers.remove(header::ACCEPT_RANGES);

    weaken_etag(&mut parts.headers);

    let body = CompressionBody::compressed(
        body,
        BrotliParams::from(settings),
        size_hint,
        always_flush,
    );
    Response::from_parts(parts, body)
}

/// Checks for a non-empty Content-Encoding header.
fn has_content_encoding(headers: &header::HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .is_some_and(|v| !v.is_empty())
}

/// Checks if Content-Range header is present (range response).
fn has_content_range(headers: &header::HeaderMap) -> bool {
    headers.contains_key(header::CONTENT_RANGE)
}

/// Adds Accept-Encoding to the Vary header if not already present.
fn add_vary_accept_encoding(headers: &mut header::HeaderMap) {
    let present = headers
        .get_all(header::VARY)
        .iter()
        .filter_map(|vary| vary.to_str().ok())
        .flat_map(|vary| vary.split(','))
        .map(str::trim)
        .any(|v| v == "*" || v.eq_ignore_ascii_case("accept-encoding"));

    if !present {
        headers.append(
            header::VARY,
            header::HeaderValue::from_static("accept-encoding"),
        );
    }
}

/// Turns a strong ETag into a weak one; the encoded bytes differ from the
/// representation the strong validator was computed for.
fn weaken_etag(headers: &mut header::HeaderMap) {
    let Some(etag) = headers.get(header::ETAG) else {
        return;
    };
    if !etag.as_bytes().starts_with(b"\"") {
        return;
    }

    let mut weak = Vec::with_capacity(etag.len() + 2);
    weak.extend_from_slice(b"W/");
    weak.extend_from_slice(etag.as_bytes());

    match header::HeaderValue::from_bytes(&weak) {
        Ok(value) => {
            headers.insert(header::ETAG, value);
        }
        Err(_) => {
            headers.remove(header::ETAG);
        }
    }
}

fn content_type(headers: &header::HeaderMap) -> &str {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

/// Checks if the content type requires always flushing (e.g., streaming).
fn is_streaming_content_type(headers: &header::HeaderMap) -> bool {
    let ct = content_type(headers);
    ct.starts_with("text/event-stream") || ct.starts_with("application/grpc-web")
}

fn content_length(headers: &header::HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Checks if Content-Length is below the minimum length.
fn is_below_min_length(headers: &header::HeaderMap, min_length: u64) -> bool {
    content_length(headers).is_some_and(|len| len < min_length)
}
