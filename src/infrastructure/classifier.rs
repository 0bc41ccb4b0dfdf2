//! Request classification.
//!
//! Maps an HTTP method and path onto a [`Category`] with ordered substring
//! rules, and recognizes operational paths that bypass admission entirely.

use crate::domain::category::Category;

/// Operational paths never subject to admission.
pub const DEFAULT_EXEMPT_PATHS: [&str; 7] = [
    "/health",
    "/healthz",
    "/ready",
    "/metrics",
    "/docs",
    "/openapi.json",
    "/redoc",
];

/// Path keyword rules, checked in order; the first match wins.
const KEYWORD_RULES: [(Category, &[&str]); 6] = [
    (
        Category::Auth,
        &["/auth", "/login", "/logout", "/token", "/register", "/password"],
    ),
    (Category::Admin, &["/admin"]),
    (Category::PresenceHeartbeat, &["/presence", "/heartbeat"]),
    (Category::Upload, &["/upload", "/files", "/attachments"]),
    (Category::Export, &["/export", "/download", "/report"]),
    (Category::Search, &["/search"]),
];

/// Classifies requests and recognizes exempt paths.
#[derive(Debug, Clone)]
pub struct RequestClassifier {
    exempt_paths: Vec<String>,
}

impl RequestClassifier {
    pub fn new() -> Self {
        Self::with_exempt_paths(DEFAULT_EXEMPT_PATHS.iter().map(|p| p.to_string()))
    }

    /// Replace the exempt set. Empty entries are dropped.
    pub fn with_exempt_paths(paths: impl IntoIterator<Item = String>) -> Self {
        let mut exempt_paths: Vec<String> = paths
            .into_iter()
            .map(|p| p.trim_end_matches('/').to_string())
            .filter(|p| !p.is_empty())
            .collect();
        exempt_paths.sort();
        exempt_paths.dedup();
        Self { exempt_paths }
    }

    /// Whether `path` is, or lies below, an exempt path.
    pub fn is_exempt(&self, path: &str) -> bool {
        self.exempt_paths.iter().any(|exempt| {
            path.strip_prefix(exempt.as_str())
                .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
        })
    }

    pub fn classify(&self, method: &str, path: &str) -> Category {
        let path = path.to_ascii_lowercase();
        for (category, keywords) in KEYWORD_RULES {
            if keywords.iter().any(|k| path.contains(k)) {
                return category;
            }
        }
        if is_safe_method(method) {
            Category::Read
        } else {
            Category::Write
        }
    }
}

impl Default for RequestClassifier {
    fn default() -> Self {
        Self::new()
    }
}

fn is_safe_method(method: &str) -> bool {
    ["GET", "HEAD", "OPTIONS"]
        .iter()
        .any(|safe| method.eq_ignore_ascii_case(safe))
}
