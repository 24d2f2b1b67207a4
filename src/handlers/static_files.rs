//! Static file responder
//!
//! Resolves request paths against the document root and returns the whole
//! file with a guessed content type.

use crate::http::HttpResponse;
use percent_encoding::percent_decode_str;
use std::borrow::Cow;
use std::fs;
use std::path::{ Component, Path, PathBuf };

/// Body of every 404, kept byte-identical to the page existing clients expect.
pub const NOT_FOUND_PAGE: &str = r#"
        <!DOCTYPE html>
        <html>
        <head>
            <title>404 - File Not Found</title>
            <style>
                body {
                    font-family: Arial, sans-serif;
                    line-height: 1.6;
                    color: #333;
                    max-width: 800px;
                    margin: 0 auto;
                    padding: 20px;
                }
                h1 {
                    color: #d9534f;
                }
                .back-link {
                    margin-top: 20px;
                }
            </style>
        </head>
        <body>
            <h1>404 - File Not Found</h1>
            <p>The requested file could not be found on this server.</p>
            <p>The PHP Media Manager is meant to be downloaded and run locally on your Mac.</p>
            <div class="back-link">
                <a href="/">Go back to homepage</a>
            </div>
        </body>
        </html>
        "#;

#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
    index: String,
    allow_traversal: bool,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>, index: impl Into<String>, allow_traversal: bool) -> Self {
        let root = root.into();
        let root = root.canonicalize().unwrap_or(root);
        Self {
            root,
            index: index.into(),
            allow_traversal,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a request path (no query string) onto the document root.
    ///
    /// Returns `None` when the path tries to leave the root and traversal is
    /// not allowed. The returned path may not exist.
    pub fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let decoded = decode_path(request_path);
        let relative = decoded.trim_start_matches('/');
        let relative = if relative.is_empty() { self.index.as_str() } else { relative };

        if self.allow_traversal {
            return Some(self.root.join(relative));
        }

        let mut full_path = self.root.clone();
        for component in Path::new(relative).components() {
            match component {
                Component::Normal(part) => full_path.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    tracing::warn!(path = request_path, "rejected path outside document root");
                    return None;
                }
            }
        }

        // symlinks may still point elsewhere
        if let Ok(real) = full_path.canonicalize() {
            if !real.starts_with(&self.root) {
                tracing::warn!(path = request_path, "rejected symlink outside document root");
                return None;
            }
        }

        Some(full_path)
    }

    /// Resolved path, only if it names a regular file.
    pub fn existing_file(&self, request_path: &str) -> Option<PathBuf> {
        self.resolve(request_path).filter(|p| p.is_file())
    }

    pub fn handle(&self, request_path: &str) -> HttpResponse {
        let full_path = match self.existing_file(request_path) {
            Some(p) => p,
            None => {
                tracing::debug!(path = request_path, "static file not found");
                return Self::not_found();
            }
        };

        match fs::read(&full_path) {
            Ok(content) => {
                HttpResponse::new("200 OK")
                    .header("Content-Type", Self::content_type(&full_path))
                    .body(content)
            }
            Err(e) => {
                tracing::error!(path = %full_path.display(), error = %e, "failed to read static file");
                HttpResponse::internal_error("Internal Server Error")
            }
        }
    }

    pub fn not_found() -> HttpResponse {
        HttpResponse::html("404 Not Found", NOT_FOUND_PAGE)
    }

    pub fn content_type(path: &Path) -> String {
        mime_guess::from_path(path).first_or_octet_stream().to_string()
    }
}

/// Percent-decoded request path, the form both file lookup and CGI
/// `SCRIPT_NAME` use.
pub fn decode_path(request_path: &str) -> Cow<'_, str> {
    percent_decode_str(request_path).decode_utf8_lossy()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> (tempfile::TempDir, StaticFiles) {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
        fs::create_dir(dir.path().join("css")).unwrap();
        fs::write(dir.path().join("css/style.css"), "body { margin: 0; }").unwrap();
        fs::write(dir.path().join("blob.zzz-unknown"), [0u8, 159, 146, 150]).unwrap();
        let files = StaticFiles::new(dir.path(), "index.html", false);
        (dir, files)
    }

    #[test]
    fn test_serves_file_bytes() {
        let (_dir, files) = site();
        let res = files.handle("/css/style.css");
        assert_eq!(res.status, "200 OK");
        assert_eq!(res.get_header("Content-Type"), Some("text/css"));
        assert_eq!(res.body, b"body { margin: 0; }");
        assert_eq!(res.get_header("Content-Length"), Some("19"));
    }

    #[test]
    fn test_root_maps_to_index() {
        let (_dir, files) = site();
        for path in ["", "/"] {
            let res = files.handle(path);
            assert_eq!(res.status, "200 OK");
            assert_eq!(res.body, b"<h1>home</h1>");
            assert_eq!(res.get_header("Content-Type"), Some("text/html"));
        }
    }

    #[test]
    fn test_unknown_extension_is_octet_stream() {
        let (_dir, files) = site();
        let res = files.handle("/blob.zzz-unknown");
        assert_eq!(res.get_header("Content-Type"), Some("application/octet-stream"));
        assert_eq!(res.body, vec![0u8, 159, 146, 150]);
    }

    #[test]
    fn test_missing_and_directory_are_404() {
        let (_dir, files) = site();
        for path in ["/nope.css", "/css", "/css/"] {
            let res = files.handle(path);
            assert_eq!(res.status, "404 Not Found");
            assert_eq!(res.body, NOT_FOUND_PAGE.as_bytes());
            assert_eq!(
                res.get_header("Content-Length"),
                Some(NOT_FOUND_PAGE.len().to_string().as_str())
            );
            assert_eq!(res.get_header("Content-Type"), Some("text/html"));
        }
    }

    #[test]
    fn test_not_found_page_text() {
        assert!(NOT_FOUND_PAGE.starts_with("\n        <!DOCTYPE html>"));
        assert!(NOT_FOUND_PAGE.contains("<title>404 - File Not Found</title>"));
        assert!(NOT_FOUND_PAGE.contains("<p>The requested file could not be found on this server.</p>"));
        assert!(NOT_FOUND_PAGE.ends_with("</html>\n        "));
    }

    #[test]
    fn test_traversal_rejected() {
        let outer = tempfile::tempdir().unwrap();
        fs::write(outer.path().join("secret.txt"), "top secret").unwrap();
        let root = outer.path().join("www");
        fs::create_dir(&root).unwrap();
        let files = StaticFiles::new(&root, "index.html", false);

        assert!(files.resolve("/../secret.txt").is_none());
        assert!(files.resolve("/%2e%2e/secret.txt").is_none());
        assert_eq!(files.handle("/../secret.txt").status, "404 Not Found");

        let permissive = StaticFiles::new(&root, "index.html", true);
        let res = permissive.handle("/../secret.txt");
        assert_eq!(res.status, "200 OK");
        assert_eq!(res.body, b"top secret");
    }

    #[test]
    fn test_percent_decoded_names() {
        let (dir, files) = site();
        fs::write(dir.path().join("my file.txt"), "spaced").unwrap();
        let res = files.handle("/my%20file.txt");
        assert_eq!(res.status, "200 OK");
        assert_eq!(res.get_header("Content-Type"), Some("text/plain"));
    }
}
