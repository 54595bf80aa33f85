//! Dashboard assets, embedded in the binary.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

const INDEX_HTML: &str = include_str!("../static/index.html");
const MAIN_JS: &str = include_str!("../static/main.js");
const STYLE_CSS: &str = include_str!("../static/style.css");

/// Static file handler
#[derive(Debug, Clone, Default)]
pub struct StaticFiles;

impl StaticFiles {
    pub fn new() -> Self {
        Self
    }

    /// The dashboard page
    pub fn index(&self) -> Response {
        serve_embedded(INDEX_HTML, "text/html; charset=utf-8")
    }

    /// Serve a file from under `/static/`
    pub fn serve(&self, path: &str) -> Response {
        let content_type = guess_content_type(path);

        match path {
            "main.js" => serve_embedded(MAIN_JS, content_type),
            "style.css" => serve_embedded(STYLE_CSS, content_type),
            _ => (StatusCode::NOT_FOUND, "File not found").into_response(),
        }
    }
}

fn guess_content_type(path: &str) -> &'static str {
    if path.ends_with(".js") {
        "application/javascript"
    } else if path.ends_with(".css") {
        "text/css"
    } else if path.ends_with(".html") {
        "text/html; charset=utf-8"
    } else {
        "application/octet-stream"
    }
}

fn serve_embedded(content: &'static str, content_type: &'static str) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        content,
    )
        .into_response()
}
