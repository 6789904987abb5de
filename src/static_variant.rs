//! Serving pre-compressed static files.
//!
//! A request for `/style.css` may be answered with the bytes of a sibling file
//! `style.css.br` that was compressed ahead of time. The selector decides
//! whether the request qualifies, locates the sibling through a [`PathMapper`]
//! and a [`FileCache`], and describes the response to send. The sibling is
//! served verbatim; nothing is compressed at request time.

use crate::config::{Settings, StaticMode};
use crate::error::{Error, OpenError, OpenErrorKind};
use crate::negotiate::{ENCODING, negotiate};
use http::{HeaderValue, Method, Request, Response, StatusCode, header};
use percent_encoding::percent_decode_str;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Suffix appended to the mapped path to find the pre-compressed sibling.
pub const SUFFIX: &str = ".br";

/// Maps a request path onto the filesystem.
pub trait PathMapper {
    /// Returns the filesystem path for `uri_path`, or `None` if it cannot be
    /// mapped.
    fn map_to_filesystem_path(&self, uri_path: &str) -> Option<PathBuf>;
}

/// Maps request paths below a document root.
///
/// Segments are percent-decoded before they are checked, so `%2e%2e` counts
/// as `..` and `%2f` cannot smuggle a separator. Paths with a `..` segment,
/// an encoded `/`, a backslash, a NUL byte or invalid UTF-8 are not mapped.
#[derive(Debug, Clone)]
pub struct RootMapper {
    root: PathBuf,
}

impl RootMapper {
    /// Creates a mapper rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl PathMapper for RootMapper {
    fn map_to_filesystem_path(&self, uri_path: &str) -> Option<PathBuf> {
        let mut path = self.root.clone();
        for segment in uri_path.split('/') {
            let segment = percent_decode_str(segment).decode_utf8().ok()?;
            match &*segment {
                "" | "." => {}
                ".." => return None,
                s if s.contains(['/', '\\', '\0']) => return None,
                s => path.push(s),
            }
        }
        Some(path)
    }
}

/// An open file and its metadata.
#[derive(Debug)]
pub struct CachedFile<H> {
    /// Handle used as the response body.
    pub handle: H,
    /// Size in bytes.
    pub size: u64,
    /// Modification time.
    pub mtime: SystemTime,
    /// The path names a directory.
    pub is_dir: bool,
    /// The path names a regular file.
    pub is_regular: bool,
}

/// Opens files and reports their metadata.
pub trait FileCache {
    /// Handle type for opened files.
    type Handle;

    /// Opens `path`.
    fn open_cached(&self, path: &Path) -> Result<CachedFile<Self::Handle>, OpenError>;
}

/// A [`FileCache`] that opens files directly, without caching.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsFileCache;

impl FileCache for FsFileCache {
    type Handle = File;

    fn open_cached(&self, path: &Path) -> Result<CachedFile<File>, OpenError> {
        let file = File::open(path).map_err(|e| OpenError::new(path, e))?;
        let metadata = file.metadata().map_err(|e| OpenError::new(path, e))?;
        let mtime = metadata.modified().map_err(|e| OpenError::new(path, e))?;

        Ok(CachedFile {
            handle: file,
            size: metadata.len(),
            mtime,
            is_dir: metadata.is_dir(),
            is_regular: metadata.is_file(),
        })
    }
}

/// Metadata of a selected sibling file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticVariantDescriptor {
    /// Path of the pre-compressed sibling.
    pub path: PathBuf,
    /// Size of the sibling in bytes.
    pub size: u64,
    /// Modification time of the sibling.
    pub mtime: SystemTime,
    /// Content type guessed from the original, unsuffixed name.
    pub content_type: String,
    /// Entity tag computed from the sibling's metadata.
    pub etag: String,
}

/// A sibling file ready to be served.
#[derive(Debug)]
pub struct StaticVariant<H> {
    /// Sibling metadata.
    pub descriptor: StaticVariantDescriptor,
    /// The opened sibling.
    pub handle: H,
    /// Whether the response must carry `Vary: Accept-Encoding`.
    pub vary: bool,
}

impl<H> StaticVariant<H> {
    /// Builds the `200 OK` response with the sibling handle as its body.
    ///
    /// For `HEAD` requests the caller is expected to discard the body.
    pub fn into_response(self) -> Response<H> {
        let StaticVariant {
            descriptor,
            handle,
            vary,
        } = self;

        let mut response = Response::new(handle);
        *response.status_mut() = StatusCode::OK;

        let headers = response.headers_mut();
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(descriptor.size));
        headers.insert(
            header::CONTENT_ENCODING,
            HeaderValue::from_static(ENCODING),
        );

        let last_modified = httpdate::fmt_http_date(descriptor.mtime);
        if let Ok(value) = HeaderValue::from_str(&last_modified) {
            headers.insert(header::LAST_MODIFIED, value);
        }
        if let Ok(value) = HeaderValue::from_str(&descriptor.etag) {
            headers.insert(header::ETAG, value);
        }
        if let Ok(value) = HeaderValue::from_str(&descriptor.content_type) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        if vary {
            headers.append(
                header::VARY,
                HeaderValue::from_static("accept-encoding"),
            );
        }

        response
    }
}

/// Outcome of [`StaticVariantSelector::select`].
#[derive(Debug)]
pub enum Selection<H> {
    /// The request does not qualify or no sibling exists; serve it some
    /// other way.
    Declined,
    /// The sibling exists but is not a regular file.
    NotFound,
    /// Serve the sibling.
    Serve(StaticVariant<H>),
}

/// Selects pre-compressed siblings for static file requests.
#[derive(Debug, Clone)]
pub struct StaticVariantSelector<M, C> {
    mode: StaticMode,
    mapper: M,
    cache: C,
}

impl StaticVariantSelector<RootMapper, FsFileCache> {
    /// Creates a selector serving siblings below `root` straight from disk.
    pub fn for_root(mode: StaticMode, root: impl Into<PathBuf>) -> Self {
        Self::new(mode, RootMapper::new(root), FsFileCache)
    }
}

impl<M, C> StaticVariantSelector<M, C>
where
    M: PathMapper,
    C: FileCache,
{
    /// Creates a selector from its collaborators.
    pub fn new(mode: StaticMode, mapper: M, cache: C) -> Self {
        Self {
            mode,
            mapper,
            cache,
        }
    }

    /// Creates a selector using the resolved [`Settings::static_mode`].
    pub fn from_settings(settings: &Settings, mapper: M, cache: C) -> Self {
        Self::new(settings.static_mode, mapper, cache)
    }

    /// Returns the configured mode.
    pub fn mode(&self) -> StaticMode {
        self.mode
    }

    /// Decides whether `req` is served from a pre-compressed sibling.
    ///
    /// In [`StaticMode::On`] the request is negotiated, which records a
    /// [`Negotiated`] marker with `vary` set whether or not the sibling is
    /// used. Missing or unreadable siblings decline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PathMapping`] if the request path cannot be mapped.
    ///
    /// [`Negotiated`]: crate::negotiate::Negotiated
    pub fn select<B>(&self, req: &mut Request<B>) -> Result<Selection<C::Handle>, Error> {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return Ok(Selection::Declined);
        }

        let uri_path = req.uri().path();
        if uri_path.ends_with('/') {
            return Ok(Selection::Declined);
        }

        let vary = match self.mode {
            StaticMode::Off => return Ok(Selection::Declined),
            StaticMode::Always => false,
            StaticMode::On => {
                if !negotiate(req, true) {
                    return Ok(Selection::Declined);
                }
                true
            }
        };

        let uri_path = req.uri().path();
        let path = self
            .mapper
            .map_to_filesystem_path(uri_path)
            .ok_or_else(|| Error::PathMapping(uri_path.to_owned()))?;
        let path = sibling_path(path);

        tracing::debug!(path = %path.display(), "brotli static filename");

        let file = match self.cache.open_cached(&path) {
            Ok(file) => file,
            Err(err) => {
                match err.kind {
                    OpenErrorKind::NotFound => {
                        tracing::debug!(
                            path = %err.path.display(),
                            error = %err.source,
                            "brotli static sibling not found"
                        )
                    }
                    OpenErrorKind::PermissionDenied | OpenErrorKind::TooManySymlinks => {
                        tracing::warn!(
                            path = %err.path.display(),
                            error = %err.source,
                            "brotli static sibling not accessible"
                        )
                    }
                    OpenErrorKind::Other => {
                        tracing::error!(
                            path = %err.path.display(),
                            error = %err.source,
                            "brotli static sibling open failed"
                        )
                    }
                }
                return Ok(Selection::Declined);
            }
        };

        if file.is_dir {
            tracing::debug!(path = %path.display(), "brotli static sibling is a directory");
            return Ok(Selection::Declined);
        }
        if !file.is_regular {
            tracing::error!(path = %path.display(), "brotli static sibling is not a regular file");
            return Ok(Selection::NotFound);
        }

        let content_type = mime_guess::from_path(uri_path)
            .first_or_octet_stream()
            .to_string();

        let descriptor = StaticVariantDescriptor {
            etag: compute_etag(file.size, file.mtime),
            path,
            size: file.size,
            mtime: file.mtime,
            content_type,
        };

        Ok(Selection::Serve(StaticVariant {
            descriptor,
            handle: file.handle,
            vary,
        }))
    }
}

/// Returns `path` with [`SUFFIX`] appended to its file name.
fn sibling_path(path: PathBuf) -> PathBuf {
    let mut name = path.into_os_string();
    name.push(SUFFIX);
    PathBuf::from(name)
}

/// Computes a strong entity tag from file metadata: `"<mtime>-<size>"`, both
/// in lowercase hex, with the mtime in whole seconds since the Unix epoch.
pub fn compute_etag(size: u64, mtime: SystemTime) -> String {
    let secs = mtime
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("\"{secs:x}-{size:x}\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiate::Negotiated;
    use std::fs;
    use std::io::Read;
    use std::time::Duration;
    use tempfile::TempDir;

    fn site() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        fs::write(dir.path().join("a/b"), b"original").unwrap();
        fs::write(dir.path().join("a/b.br"), b"compressed-b").unwrap();
        fs::write(dir.path().join("style.css"), b"body {}").unwrap();
        fs::write(dir.path().join("style.css.br"), b"compressed-css").unwrap();
        fs::write(dir.path().join("plain.txt"), b"no sibling").unwrap();
        fs::create_dir_all(dir.path().join("dir.br")).unwrap();
        dir
    }

    fn request(method: Method, path: &str, accept_encoding: Option<&'static str>) -> Request<()> {
        let mut builder = Request::builder().method(method).uri(path);
        if let Some(value) = accept_encoding {
            builder = builder.header(header::ACCEPT_ENCODING, value);
        }
        builder.body(()).unwrap()
    }

    fn select(
        mode: StaticMode,
        root: &Path,
        req: &mut Request<()>,
    ) -> Selection<File> {
        StaticVariantSelector::for_root(mode, root)
            .select(req)
            .unwrap()
    }

    fn served(selection: Selection<File>) -> StaticVariant<File> {
        match selection {
            Selection::Serve(variant) => variant,
            other => panic!("Expected a served variant, got {other:?}"),
        }
    }

    #[test]
    fn test_serves_sibling_when_accepted() {
        let site = site();
        let mut req = request(Method::GET, "/a/b", Some("gzip, br"));
        let variant = served(select(StaticMode::On, site.path(), &mut req));

        assert_eq!(variant.descriptor.path, site.path().join("a/b.br"));
        assert_eq!(variant.descriptor.size, 12);
        assert!(variant.vary);
        // Derived from "/a/b", which has no extension
        assert_eq!(variant.descriptor.content_type, "application/octet-stream");

        let response = variant.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(header::CONTENT_ENCODING).unwrap(), "br");
        assert_eq!(response.headers().get(header::CONTENT_LENGTH).unwrap(), "12");
        assert_eq!(
            response.headers().get(header::VARY).unwrap(),
            "accept-encoding"
        );

        let mut body = String::new();
        response.into_body().read_to_string(&mut body).unwrap();
        assert_eq!(body, "compressed-b");
    }

    #[test]
    fn test_content_type_from_original_name() {
        let site = site();
        let mut req = request(Method::GET, "/style.css", Some("br"));
        let variant = served(select(StaticMode::On, site.path(), &mut req));

        assert_eq!(variant.descriptor.content_type, "text/css");
        let response = variant.into_response();
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/css"
        );
    }

    #[test]
    fn test_validators() {
        let site = site();
        let mtime = fs::metadata(site.path().join("style.css.br"))
            .unwrap()
            .modified()
            .unwrap();

        let mut req = request(Method::HEAD, "/style.css", Some("br"));
        let response = served(select(StaticMode::On, site.path(), &mut req)).into_response();

        assert_eq!(
            response.headers().get(header::LAST_MODIFIED).unwrap(),
            httpdate::fmt_http_date(mtime).as_str()
        );
        assert_eq!(
            response.headers().get(header::ETAG).unwrap(),
            compute_etag(14, mtime).as_str()
        );
    }

    #[test]
    fn test_on_mode_declines_without_acceptance() {
        let site = site();
        for accept_encoding in [None, Some("gzip"), Some("br;q=0")] {
            let mut req = request(Method::GET, "/style.css", accept_encoding);
            assert!(matches!(
                select(StaticMode::On, site.path(), &mut req),
                Selection::Declined
            ));
            assert_eq!(
                req.extensions().get::<Negotiated>(),
                Some(&Negotiated {
                    accepted: false,
                    vary: true
                })
            );
        }
    }

    #[test]
    fn test_always_mode_ignores_accept_encoding() {
        let site = site();
        let mut req = request(Method::GET, "/style.css", None);
        let variant = served(select(StaticMode::Always, site.path(), &mut req));

        assert!(!variant.vary);
        assert!(req.extensions().get::<Negotiated>().is_none());

        let response = variant.into_response();
        assert_eq!(response.headers().get(header::CONTENT_ENCODING).unwrap(), "br");
        assert!(response.headers().get(header::VARY).is_none());
    }

    #[test]
    fn test_off_mode_declines() {
        let site = site();
        let mut req = request(Method::GET, "/style.css", Some("br"));
        assert!(matches!(
            select(StaticMode::Off, site.path(), &mut req),
            Selection::Declined
        ));
        assert!(req.extensions().get::<Negotiated>().is_none());
    }

    #[test]
    fn test_declines_other_methods() {
        let site = site();
        let mut req = request(Method::POST, "/style.css", Some("br"));
        assert!(matches!(
            select(StaticMode::Always, site.path(), &mut req),
            Selection::Declined
        ));
    }

    #[test]
    fn test_declines_trailing_slash() {
        let site = site();
        let mut req = request(Method::GET, "/a/", Some("br"));
        assert!(matches!(
            select(StaticMode::Always, site.path(), &mut req),
            Selection::Declined
        ));
    }

    #[test]
    fn test_declines_missing_sibling() {
        let site = site();
        for path in ["/plain.txt", "/missing.js", "/plain.txt/child"] {
            let mut req = request(Method::GET, path, Some("br"));
            assert!(
                matches!(
                    select(StaticMode::Always, site.path(), &mut req),
                    Selection::Declined
                ),
                "{path}"
            );
        }
    }

    #[test]
    fn test_declines_directory_sibling() {
        let site = site();
        let mut req = request(Method::GET, "/dir", Some("br"));
        assert!(matches!(
            select(StaticMode::Always, site.path(), &mut req),
            Selection::Declined
        ));
    }

    #[test]
    fn test_irregular_sibling_is_not_found() {
        struct FifoCache;

        impl FileCache for FifoCache {
            type Handle = ();

            fn open_cached(&self, _path: &Path) -> Result<CachedFile<()>, OpenError> {
                Ok(CachedFile {
                    handle: (),
                    size: 0,
                    mtime: UNIX_EPOCH,
                    is_dir: false,
                    is_regular: false,
                })
            }
        }

        let selector = StaticVariantSelector::new(StaticMode::Always, RootMapper::new("/srv"), FifoCache);
        let mut req = request(Method::GET, "/pipe", None);
        assert!(matches!(selector.select(&mut req).unwrap(), Selection::NotFound));
    }

    #[test]
    fn test_unmappable_path_is_an_error() {
        let selector = StaticVariantSelector::for_root(StaticMode::Always, "/srv");
        let mut req = request(Method::GET, "/a/../../etc/passwd", None);
        assert!(matches!(selector.select(&mut req), Err(Error::PathMapping(_))));
    }

    #[test]
    fn test_root_mapper() {
        let mapper = RootMapper::new("/srv/www");
        assert_eq!(
            mapper.map_to_filesystem_path("/a/./b.css"),
            Some(PathBuf::from("/srv/www/a/b.css"))
        );
        assert_eq!(
            mapper.map_to_filesystem_path("//index.html"),
            Some(PathBuf::from("/srv/www/index.html"))
        );
        assert_eq!(mapper.map_to_filesystem_path("/../secret"), None);
        assert_eq!(mapper.map_to_filesystem_path("/a\\b"), None);
    }

    #[test]
    fn test_root_mapper_decodes_segments() {
        let mapper = RootMapper::new("/srv/www");
        assert_eq!(
            mapper.map_to_filesystem_path("/my%20file.css"),
            Some(PathBuf::from("/srv/www/my file.css"))
        );
        assert_eq!(
            mapper.map_to_filesystem_path("/caf%C3%A9.txt"),
            Some(PathBuf::from("/srv/www/café.txt"))
        );
        assert_eq!(
            mapper.map_to_filesystem_path("/a/%2e/b"),
            Some(PathBuf::from("/srv/www/a/b"))
        );
    }

    #[test]
    fn test_root_mapper_rejects_encoded_traversal() {
        let mapper = RootMapper::new("/srv/www");
        for path in [
            "/%2e%2e/secret",
            "/a/%2E%2E/%2e%2e/etc/passwd",
            "/.%2e/secret",
            "/a%2fb",
            "/..%2fsecret",
            "/a%5cb",
            "/a%00b",
            "/%ff",
        ] {
            assert_eq!(mapper.map_to_filesystem_path(path), None, "{path}");
        }
    }

    #[test]
    fn test_serves_percent_encoded_name() {
        let site = site();
        fs::write(site.path().join("my file.css.br"), b"compressed-spaced").unwrap();

        let mut req = request(Method::GET, "/my%20file.css", Some("br"));
        let variant = served(select(StaticMode::On, site.path(), &mut req));

        assert_eq!(variant.descriptor.path, site.path().join("my file.css.br"));
        assert_eq!(variant.descriptor.content_type, "text/css");

        let mut body = String::new();
        variant
            .into_response()
            .into_body()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "compressed-spaced");
    }

    #[test]
    fn test_encoded_traversal_is_an_error() {
        let site = site();
        let selector = StaticVariantSelector::for_root(StaticMode::Always, site.path().join("a"));
        for path in ["/%2e%2e/style.css", "/%2E%2E%2fstyle.css"] {
            let mut req = request(Method::GET, path, None);
            assert!(
                matches!(selector.select(&mut req), Err(Error::PathMapping(_))),
                "{path}"
            );
        }
    }

    #[test]
    fn test_from_settings_uses_static_mode() {
        let site = site();
        let settings = Settings {
            static_mode: StaticMode::Always,
            ..Settings::default()
        };
        let selector =
            StaticVariantSelector::from_settings(&settings, RootMapper::new(site.path()), FsFileCache);
        assert_eq!(selector.mode(), StaticMode::Always);

        let mut req = request(Method::GET, "/style.css", None);
        assert!(matches!(selector.select(&mut req).unwrap(), Selection::Serve(_)));

        let selector = StaticVariantSelector::from_settings(
            &Settings::default(),
            RootMapper::new(site.path()),
            FsFileCache,
        );
        let mut req = request(Method::GET, "/style.css", Some("br"));
        assert!(matches!(selector.select(&mut req).unwrap(), Selection::Declined));
    }

    #[test]
    fn test_sibling_path() {
        assert_eq!(
            sibling_path(PathBuf::from("/srv/app.js")),
            PathBuf::from("/srv/app.js.br")
        );
    }

    #[test]
    fn test_compute_etag() {
        let mtime = UNIX_EPOCH + Duration::from_secs(0x5f5e_1000);
        assert_eq!(compute_etag(0x1a, mtime), "\"5f5e1000-1a\"");
        assert_eq!(compute_etag(0, UNIX_EPOCH), "\"0-0\"");
    }
}
