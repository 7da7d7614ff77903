//! File extension to MIME type mapping for locally served files.

use std::path::Path;

/// Source files a dev server would normally transpile are served as plain text.
const PLAIN_TEXT_EXTENSIONS: &[&str] = &["ts", "tsx", "jsx"];

pub fn mimetype(path: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    if let Some(ext) = ext.as_deref() {
        if PLAIN_TEXT_EXTENSIONS.contains(&ext) {
            return "text/plain".to_string();
        }
    }

    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}
