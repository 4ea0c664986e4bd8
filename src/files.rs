//! Static file serving from a site root

use crate::error::ResponseError;
use crate::request::Request;
use crate::response::ResponseWriter;
use crate::status::Status;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::fmt::Write as _;
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// Document served when a directory is requested
pub const INDEX_FILE: &str = "index.gmi";

/// Directory under a user's home served for `/~user/` paths
pub const USER_DIR: &str = "public_gemini";

const GEMINI_MIME: &str = "text/gemini";
const FALLBACK_MIME: &str = "application/octet-stream";

/// Characters escaped in generated link targets
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'/');

/// Serves files below `root`
#[derive(Debug, Clone)]
pub struct FileServer {
    root: PathBuf,
    auto_index: bool,
    user_paths: bool,
}

impl FileServer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            auto_index: false,
            user_paths: false,
        }
    }

    /// List directories that have no index document
    pub fn with_auto_index(mut self, enabled: bool) -> Self {
        self.auto_index = enabled;
        self
    }

    /// Map `/~name/...` onto `~name/public_gemini/...`
    pub fn with_user_paths(mut self, enabled: bool) -> Self {
        self.user_paths = enabled;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn serve(&self, req: &Request, w: &mut ResponseWriter) -> Result<(), ResponseError> {
        let request_path = req.path();

        let Some(path) = self.filesystem_path(request_path) else {
            debug!(path = request_path, "Rejected request path");
            return w
                .status(Status::NOT_FOUND, &format!("can't find {}", request_path))
                .await;
        };

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Stat failed");
                return w
                    .status(Status::NOT_FOUND, &format!("can't find {}", request_path))
                    .await;
            }
        };

        if !metadata.is_dir() {
            return serve_file(&path, w).await;
        }

        if !request_path.ends_with('/') {
            let location = match req.query() {
                Some(query) => format!("{}/?{}", request_path, query),
                None => format!("{}/", request_path),
            };
            return w.status(Status::REDIRECT_PERMANENT, &location).await;
        }

        let index = path.join(INDEX_FILE);
        let has_index = tokio::fs::metadata(&index)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if has_index {
            return serve_file(&index, w).await;
        }

        if self.auto_index {
            return write_listing(&path, request_path, w).await;
        }

        w.status(Status::NOT_FOUND, "this is a folder, but has no index")
            .await
    }

    /// Map a request path onto the filesystem, refusing anything that would
    /// leave the root
    fn filesystem_path(&self, request_path: &str) -> Option<PathBuf> {
        let decoded = percent_decode_str(request_path).decode_utf8().ok()?;

        if self.user_paths {
            if let Some(rest) = decoded.strip_prefix("/~") {
                let (user, tail) = rest.split_once('/').unwrap_or((rest, ""));
                let home = home_dir(user)?;
                return Some(home.join(USER_DIR).join(relative_path(tail)?));
            }
        }

        Some(self.root.join(relative_path(&decoded)?))
    }
}

/// Normal components of `path`; `None` if any component climbs upwards
fn relative_path(path: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(segment) => relative.push(segment),
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(relative)
}

#[cfg(unix)]
fn home_dir(user: &str) -> Option<PathBuf> {
    use std::ffi::{CStr, CString, OsStr};
    use std::os::unix::ffi::OsStrExt;

    if user.is_empty() || !user.chars().all(|c| c.is_ascii_alphanumeric() || "._-".contains(c)) {
        return None;
    }
    let name = CString::new(user).ok()?;
    let mut buf = vec![0 as libc::c_char; 16 * 1024];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    let rc = unsafe {
        libc::getpwnam_r(
            name.as_ptr(),
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() || pwd.pw_dir.is_null() {
        return None;
    }

    let dir = unsafe { CStr::from_ptr(pwd.pw_dir) };
    Some(PathBuf::from(OsStr::from_bytes(dir.to_bytes())))
}

#[cfg(not(unix))]
fn home_dir(_user: &str) -> Option<PathBuf> {
    None
}

/// Media type for a file, by extension
pub fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("gmi") | Some("gemini") => GEMINI_MIME,
        _ => mime_guess::from_path(path).first_raw().unwrap_or(FALLBACK_MIME),
    }
}

/// Open `path` for reading without blocking on FIFOs or devices, then
/// refuse anything that is not a regular file
async fn open_regular(path: &Path) -> io::Result<tokio::fs::File> {
    let mut options = tokio::fs::OpenOptions::new();
    options.read(true);
    #[cfg(unix)]
    options.custom_flags(libc::O_NONBLOCK);

    let file = options.open(path).await?;
    if !file.metadata().await?.is_file() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"));
    }
    Ok(file)
}

async fn serve_file(path: &Path, w: &mut ResponseWriter) -> Result<(), ResponseError> {
    let mut file = match open_regular(path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Can't open file");
            return w.status(Status::TEMPORARY_FAILURE, "can't open file").await;
        }
    };

    w.status(Status::SUCCESS, content_type(path)).await?;
    match tokio::io::copy(&mut file, w).await {
        Ok(bytes) => debug!(path = %path.display(), bytes, "File served"),
        Err(e) => warn!(path = %path.display(), error = %e, "File transfer cut short"),
    }
    Ok(())
}

async fn write_listing(dir: &Path, request_path: &str, w: &mut ResponseWriter) -> Result<(), ResponseError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => return w.status(Status::NOT_FOUND, &e.to_string()).await,
    };

    let mut names = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => {
                let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
                names.push((entry.file_name().to_string_lossy().into_owned(), is_dir));
            }
            Ok(None) => break,
            Err(e) => return w.status(Status::PERMANENT_FAILURE, &e.to_string()).await,
        }
    }

    let listing = render_listing(request_path, names);
    if listing.len() as u64 > w.body_limit() {
        warn!(path = %dir.display(), bytes = listing.len(), "Directory listing exceeds body cap");
        return w
            .status(Status::PERMANENT_FAILURE, "directory listing too large")
            .await;
    }
    w.status(Status::SUCCESS, GEMINI_MIME).await?;
    w.write_body(listing.as_bytes()).await
}

/// Gemtext index of a directory; entries are sorted by name
pub fn render_listing(request_path: &str, mut entries: Vec<(String, bool)>) -> String {
    entries.sort();

    let mut out = String::new();
    let _ = writeln!(out, "# {}", request_path);
    out.push('\n');
    out.push_str("=> .. ..\n");
    for (name, is_dir) in &entries {
        let slash = if *is_dir { "/" } else { "" };
        let _ = writeln!(
            out,
            "=> ./{}{} {}{}",
            utf8_percent_encode(name, SEGMENT),
            slash,
            name,
            slash
        );
    }
    out.push('\n');
    out.push_str("Served by gemgate\n");
    out
}
