//! Longest-pattern path routing
//!
//! Patterns name either an exact path (`/favicon.txt`) or a subtree when they
//! end in a slash (`/docs/`). The longest matching pattern wins, so `/docs/api/`
//! beats `/docs/` and `/` catches whatever nothing else does. Requests for
//! uncanonical paths (`.`/`..` segments, repeated slashes) and for a subtree
//! root without its slash are redirected instead of served.

use crate::error::{ConfigError, ResponseError};
use crate::handler::Handler;
use crate::request::Request;
use crate::response::ResponseWriter;
use crate::status::Status;
use std::collections::HashMap;
use tracing::debug;

static NOT_FOUND: Handler = Handler::NotFound;

/// Outcome of looking a path up in a `Router`
#[derive(Debug)]
pub enum Resolution<'a> {
    /// Serve with this handler; `pattern` is empty for the built-in not-found
    Handler { handler: &'a Handler, pattern: &'a str },
    /// Redirect permanently to this canonical path
    Redirect(String),
}

/// Route registry; populated at startup and read-only while serving
#[derive(Default)]
pub struct Router {
    routes: HashMap<String, Handler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `pattern`
    pub fn register(&mut self, pattern: impl Into<String>, handler: Handler) -> Result<(), ConfigError> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(ConfigError::InvalidPattern(pattern));
        }
        if self.routes.contains_key(&pattern) {
            return Err(ConfigError::DuplicateRoute(pattern));
        }
        self.routes.insert(pattern, handler);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Registered patterns, sorted
    pub fn patterns(&self) -> Vec<&str> {
        let mut patterns: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        patterns.sort_unstable();
        patterns
    }

    pub fn resolve<'a>(&'a self, path: &str) -> Resolution<'a> {
        let cleaned = clean_path(path);
        if cleaned != path {
            return Resolution::Redirect(cleaned);
        }

        if !path.ends_with('/') && !self.routes.contains_key(path) {
            let subtree = format!("{}/", path);
            if self.routes.contains_key(&subtree) {
                return Resolution::Redirect(subtree);
            }
        }

        match self.best_match(path) {
            Some((pattern, handler)) => Resolution::Handler { handler, pattern },
            None => Resolution::Handler {
                handler: &NOT_FOUND,
                pattern: "",
            },
        }
    }

    /// Longest matching pattern; equal lengths go to the smallest pattern
    fn best_match(&self, path: &str) -> Option<(&str, &Handler)> {
        self.routes
            .iter()
            .filter(|(pattern, _)| pattern_matches(pattern, path))
            .max_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| b.cmp(a)))
            .map(|(pattern, handler)| (pattern.as_str(), handler))
    }

    pub async fn serve(&self, req: &mut Request, w: &mut ResponseWriter) -> Result<(), ResponseError> {
        match self.resolve(req.path()) {
            Resolution::Redirect(target) => {
                let location = match req.query() {
                    Some(query) => format!("{}?{}", target, query),
                    None => target,
                };
                debug!(from = req.path(), to = %location, "Redirecting to canonical path");
                w.status(Status::REDIRECT_PERMANENT, &location).await
            }
            Resolution::Handler { handler, pattern } => {
                debug!(path = req.path(), pattern, handler = handler.kind(), "Route matched");
                handler.serve(req, w).await
            }
        }
    }
}

fn pattern_matches(pattern: &str, path: &str) -> bool {
    if pattern.ends_with('/') {
        path.starts_with(pattern)
    } else {
        pattern == path
    }
}

/// Canonical form of `path`: rooted, no `.`/`..` segments, no repeated
/// slashes, trailing slash kept when the input had one
pub fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut cleaned = String::with_capacity(path.len() + 1);
    for segment in &segments {
        cleaned.push('/');
        cleaned.push_str(segment);
    }
    if cleaned.is_empty() || path.ends_with('/') {
        cleaned.push('/');
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::FileServer;

    fn files(root: &str) -> Handler {
        Handler::Files(FileServer::new(root))
    }

    fn matched<'a>(router: &'a Router, path: &str) -> (&'a Handler, &'a str) {
        match router.resolve(path) {
            Resolution::Handler { handler, pattern } => (handler, pattern),
            Resolution::Redirect(to) => panic!("unexpected redirect to {}", to),
        }
    }

    fn root_of(handler: &Handler) -> &str {
        match handler {
            Handler::Files(files) => files.root().to_str().unwrap(),
            other => panic!("unexpected handler {:?}", other),
        }
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path(""), "/");
        assert_eq!(clean_path("/"), "/");
        assert_eq!(clean_path("/a/b"), "/a/b");
        assert_eq!(clean_path("/a/b/"), "/a/b/");
        assert_eq!(clean_path("//a///b"), "/a/b");
        assert_eq!(clean_path("/a/./b/../c/"), "/a/c/");
        assert_eq!(clean_path("/a/.."), "/");
        assert_eq!(clean_path("/../../etc/passwd"), "/etc/passwd");
        assert_eq!(clean_path("a/b"), "/a/b");
    }

    #[test]
    fn test_register_rejects_empty_and_duplicates() {
        let mut router = Router::new();
        assert_eq!(
            router.register("", Handler::NotFound),
            Err(ConfigError::InvalidPattern(String::new()))
        );
        router.register("/docs/", files("/srv/docs")).unwrap();
        assert_eq!(
            router.register("/docs/", files("/srv/other")),
            Err(ConfigError::DuplicateRoute("/docs/".to_string()))
        );
        assert_eq!(router.len(), 1);
    }

    #[test]
    fn test_exact_beats_enclosing_subtree() {
        let mut router = Router::new();
        router.register("/docs/", files("/subtree")).unwrap();
        router.register("/docs/index.gmi", files("/exact")).unwrap();

        let (handler, pattern) = matched(&router, "/docs/index.gmi");
        assert_eq!(pattern, "/docs/index.gmi");
        assert_eq!(root_of(handler), "/exact");

        let (handler, pattern) = matched(&router, "/docs/other.gmi");
        assert_eq!(pattern, "/docs/");
        assert_eq!(root_of(handler), "/subtree");
    }

    #[test]
    fn test_longest_subtree_wins() {
        let mut router = Router::new();
        router.register("/", files("/root")).unwrap();
        router.register("/images/", files("/images")).unwrap();
        router.register("/images/thumbnails/", files("/thumbs")).unwrap();

        assert_eq!(matched(&router, "/images/thumbnails/a.png").1, "/images/thumbnails/");
        assert_eq!(matched(&router, "/images/a.png").1, "/images/");
        assert_eq!(matched(&router, "/elsewhere").1, "/");
    }

    #[test]
    fn test_subtree_root_without_slash_redirects() {
        let mut router = Router::new();
        router.register("/images/", files("/images")).unwrap();

        match router.resolve("/images") {
            Resolution::Redirect(to) => assert_eq!(to, "/images/"),
            other => panic!("expected redirect, got {:?}", other),
        }
    }

    #[test]
    fn test_explicit_registration_overrides_subtree_redirect() {
        let mut router = Router::new();
        router.register("/images/", files("/images")).unwrap();
        router.register("/images", files("/plain")).unwrap();

        let (handler, pattern) = matched(&router, "/images");
        assert_eq!(pattern, "/images");
        assert_eq!(root_of(handler), "/plain");
    }

    #[test]
    fn test_uncanonical_path_redirects() {
        let mut router = Router::new();
        router.register("/", files("/root")).unwrap();

        match router.resolve("/a//b/../c") {
            Resolution::Redirect(to) => assert_eq!(to, "/a/c"),
            other => panic!("expected redirect, got {:?}", other),
        }
    }

    #[test]
    fn test_unmatched_path_is_not_found() {
        let mut router = Router::new();
        router.register("/docs/", files("/docs")).unwrap();

        let (handler, pattern) = matched(&router, "/other");
        assert!(matches!(handler, Handler::NotFound));
        assert_eq!(pattern, "");

        let empty = Router::new();
        let (handler, pattern) = matched(&empty, "/");
        assert!(matches!(handler, Handler::NotFound));
        assert_eq!(pattern, "");
    }

    #[test]
    fn test_patterns_sorted() {
        let mut router = Router::new();
        router.register("/b", Handler::NotFound).unwrap();
        router.register("/a/", Handler::NotFound).unwrap();
        assert_eq!(router.patterns(), vec!["/a/", "/b"]);
    }
}
