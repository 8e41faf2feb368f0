//! Cross-origin isolation policy
//!
//! The page hosting a preview has to be cross-origin isolated, and the preview
//! itself is embedded in a sandboxed frame. This module holds both policies:
//! - the response headers the hosting page must present
//! - a checker that reports which of them are missing
//! - the frame attributes the preview is rendered with

use crate::error::{Error, Result};

/// Headers the hosting page must send, with their required values
pub const REQUIRED_HEADERS: &[(&str, &str)] = &[
    ("Cross-Origin-Embedder-Policy", "require-corp"),
    ("Cross-Origin-Opener-Policy", "same-origin"),
    ("Cross-Origin-Resource-Policy", "same-origin"),
];

/// Headers that keep the hosting page from being served stale
pub const NO_CACHE_HEADERS: &[(&str, &str)] = &[
    ("Cache-Control", "no-store, max-age=0"),
    ("Pragma", "no-cache"),
];

/// Frame sandbox tokens; top-level navigation is deliberately absent
pub const FRAME_SANDBOX: &str =
    "allow-forms allow-modals allow-popups allow-presentation allow-same-origin allow-scripts allow-downloads";

/// Frame permissions policy
pub const FRAME_ALLOW: &str = "cross-origin-isolated";

/// Every header a hosting page should set, isolation first
pub fn hosting_headers() -> impl Iterator<Item = (&'static str, &'static str)> {
    REQUIRED_HEADERS.iter().chain(NO_CACHE_HEADERS).copied()
}

/// Check a response's headers against [`REQUIRED_HEADERS`].
///
/// Names match case-insensitively; values match case-insensitively after
/// trimming. The error lists every missing or mismatched header.
pub fn check_headers<'a, I>(headers: I) -> Result<()>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let headers: Vec<(&str, &str)> = headers.into_iter().collect();

    let problems: Vec<String> = REQUIRED_HEADERS
        .iter()
        .filter_map(|(name, expected)| {
            let found = headers
                .iter()
                .find(|(candidate, _)| candidate.trim().eq_ignore_ascii_case(name))
                .map(|(_, value)| value.trim());
            match found {
                Some(value) if value.eq_ignore_ascii_case(expected) => None,
                Some(value) => Some(format!("{} is \"{}\", expected \"{}\"", name, value, expected)),
                None => Some(format!("{} is missing", name)),
            }
        })
        .collect();

    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "Cross-origin isolation headers not set: {}",
            problems.join("; ")
        )))
    }
}

/// The frame a ready preview is rendered in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewFrame {
    /// Frame source
    pub url: String,
}

impl PreviewFrame {
    pub fn new(url: impl Into<String>) -> Self {
        PreviewFrame { url: url.into() }
    }

    /// Render as an `<iframe>` element
    pub fn to_html(&self) -> String {
        format!(
            "<iframe src=\"{}\" sandbox=\"{}\" allow=\"{}\" title=\"Preview\"></iframe>",
            escape_attribute(&self.url),
            FRAME_SANDBOX,
            FRAME_ALLOW
        )
    }
}

fn escape_attribute(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{classify, ErrorCategory};

    #[test]
    fn test_isolated_page_passes() {
        let headers = [
            ("cross-origin-embedder-policy", "require-corp"),
            ("Cross-Origin-Opener-Policy", " same-origin "),
            ("CROSS-ORIGIN-RESOURCE-POLICY", "same-origin"),
            ("Content-Type", "text/html"),
        ];
        assert!(check_headers(headers).is_ok());
        assert!(check_headers(hosting_headers()).is_ok());
    }

    #[test]
    fn test_missing_headers_classify() {
        let err = check_headers([
            ("Cross-Origin-Embedder-Policy", "unsafe-none"),
            ("Cross-Origin-Opener-Policy", "same-origin"),
        ])
        .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("Cross-Origin-Embedder-Policy is \"unsafe-none\""));
        assert!(message.contains("Cross-Origin-Resource-Policy is missing"));
        assert_eq!(classify(&err).category, ErrorCategory::MissingSecurityHeaders);
    }

    #[test]
    fn test_frame_policy() {
        let html = PreviewFrame::new("http://localhost:3000/?a=1&b=\"2\"").to_html();
        assert!(html.contains("src=\"http://localhost:3000/?a=1&amp;b=&quot;2&quot;\""));
        assert!(html.contains("allow=\"cross-origin-isolated\""));
        assert!(!FRAME_SANDBOX.contains("allow-top-navigation"));
    }
}
