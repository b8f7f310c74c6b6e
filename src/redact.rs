//! Redaction of sensitive URL query values.
//!
//! Registries commonly redirect blob requests to pre-signed backend URLs
//! (S3, GCS, ...) whose query parameters embed credentials. Every URL that
//! leaves this crate through an error or a log field goes through here first.

use reqwest::Url;

/// The literal that replaces every query-parameter value in an externally
/// visible URL.
pub const REDACTED: &str = "REDACTED";

/// Returns a copy of `url` with every query-parameter value replaced by
/// [`REDACTED`]. Scheme, host, path and fragment are preserved.
pub fn redact_query_values(url: &Url) -> Url {
    let mut safe = url.clone();
    if url.query().is_some() {
        let keys: Vec<String> = url.query_pairs().map(|(k, _)| k.into_owned()).collect();
        safe.query_pairs_mut()
            .clear()
            .extend_pairs(keys.iter().map(|k| (k.as_str(), REDACTED)));
    }
    safe
}

/// Redacted display form of a URL, for error messages and log fields.
pub fn safe_url(url: &Url) -> String {
    redact_query_values(url).to_string()
}

/// Renders a transport error with any URL it carries redacted.
///
/// `reqwest` errors embed the request URL and interpolate it into their
/// `Display` output, so the URL is swapped for its safe form before the
/// message is rendered.
pub fn safe_error(err: &reqwest::Error) -> String {
    match err.url() {
        Some(url) => {
            let safe = redact_query_values(url);
            err.to_string().replace(url.as_str(), safe.as_str())
        }
        None => err.to_string(),
    }
}
