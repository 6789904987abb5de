//! `Accept-Encoding` negotiation for a single content coding.
//!
//! Only the question "does the client accept this token?" is answered here;
//! there is no ranking between codings. A token is accepted when it appears
//! as a whole list member without a zero quality value.

use http::{Request, header};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// The content coding produced by this crate.
pub const ENCODING: &str = "br";

/// Request extension recording that `Accept-Encoding` has been negotiated.
///
/// The first stage that negotiates inserts it; later stages read the stored
/// decision instead of parsing the header again, so two stages can never pick
/// different outcomes for the same request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    /// Whether the client accepts [`ENCODING`].
    pub accepted: bool,
    /// Whether the response depends on `Accept-Encoding` and needs a `Vary`.
    pub vary: bool,
}

/// Request extension through which inner stages ask for `Vary: Accept-Encoding`.
///
/// The compression service installs one before calling the inner service and
/// reads it when the response arrives. [`negotiate`] sets it whenever it is
/// called with `vary`, so a static stage that negotiated and then declined
/// still marks the fallback response.
#[derive(Debug, Clone, Default)]
pub struct VaryHandle(Arc<AtomicBool>);

impl VaryHandle {
    /// Requests `Vary: Accept-Encoding` on the response.
    pub fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Returns `true` once any stage requested `Vary`.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Returns `true` if `header` (an `Accept-Encoding` value) accepts `token`.
///
/// Matching is ASCII case-insensitive and bounded: the byte before the token
/// must be a space, a comma or the start of the value, and the byte after it a
/// space, comma, semicolon or the end of the value. The first bounded
/// occurrence decides the result:
///
/// - no parameters, or parameters that do not look like `q=<digit>`: accepted
/// - `q=` followed by anything but `0`: accepted
/// - `q=0`, `q=0.`, `q=0.0`, `q=0.00`, `q=0.000`: rejected
/// - `q=0.` followed by a non-zero digit within three places: accepted
pub fn is_encoding_acceptable(header: &[u8], token: &[u8]) -> bool {
    if token.is_empty() || header.len() < token.len() {
        return false;
    }

    let mut from = 0;
    while let Some(offset) = find_ignore_ascii_case(&header[from..], token) {
        let start = from + offset;
        let end = start + token.len();
        from = end;

        let before = if start == 0 { b' ' } else { header[start - 1] };
        let after = header.get(end).copied().unwrap_or(b' ');

        if !matches!(before, b',' | b' ') || !matches!(after, b',' | b' ' | b';') {
            continue;
        }

        return !has_zero_quality(&header[end..]);
    }

    false
}

/// Negotiates [`ENCODING`] for `req`, reusing an earlier decision if present.
///
/// `vary` marks that the caller's response depends on the outcome; it is
/// merged into an existing [`Negotiated`] marker rather than replacing it,
/// and forwarded to a [`VaryHandle`] if the request carries one.
pub fn negotiate<B>(req: &mut Request<B>, vary: bool) -> bool {
    if vary {
        if let Some(handle) = req.extensions().get::<VaryHandle>() {
            handle.set();
        }
    }

    if let Some(previous) = req.extensions_mut().get_mut::<Negotiated>() {
        previous.vary |= vary;
        return previous.accepted;
    }

    let accepted = req
        .headers()
        .get(header::ACCEPT_ENCODING)
        .is_some_and(|value| is_encoding_acceptable(value.as_bytes(), ENCODING.as_bytes()));

    tracing::trace!(accepted, "negotiated {ENCODING} content coding");

    req.extensions_mut().insert(Negotiated { accepted, vary });
    accepted
}

fn find_ignore_ascii_case(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
}

/// Inspects the bytes following a matched token for `;q=0[.[0[0[0]]]]`.
fn has_zero_quality(rest: &[u8]) -> bool {
    let mut cursor = Cursor { rest };

    cursor.skip_spaces();
    if !cursor.eat(|b| b == b';') {
        return false;
    }
    cursor.skip_spaces();
    if !cursor.eat(|b| b.eq_ignore_ascii_case(&b'q')) {
        return false;
    }
    cursor.skip_spaces();
    if !cursor.eat(|b| b == b'=') {
        return false;
    }
    cursor.skip_spaces();
    if !cursor.eat(|b| b == b'0') {
        return false;
    }
    if !cursor.eat(|b| b == b'.') {
        return true;
    }

    // Only the first three fractional places count; a missing or non-digit
    // place ends the fraction.
    !cursor
        .rest
        .iter()
        .take(3)
        .take_while(|b| b.is_ascii_digit())
        .any(|&digit| digit != b'0')
}

struct Cursor<'a> {
    rest: &'a [u8],
}

impl Cursor<'_> {
    fn skip_spaces(&mut self) {
        while let [b' ', tail @ ..] = self.rest {
            self.rest = tail;
        }
    }

    fn eat(&mut self, accept: impl Fn(u8) -> bool) -> bool {
        match self.rest {
            [first, tail @ ..] if accept(*first) => {
                self.rest = tail;
                true
            }
            _ => false,
        }
    }
}
