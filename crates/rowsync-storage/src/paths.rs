//! Relative request paths built through `reqwest::Url`, so ids and query
//! values from input files cannot escape their segment.

use reqwest::Url;

use crate::client::ApiError;

const SCRATCH_BASE: &str = "http://rowsync.invalid/";

fn invalid(path: &str, message: impl Into<String>) -> ApiError {
    ApiError::InvalidPath {
        path: path.to_string(),
        message: message.into(),
    }
}

/// Resolve an absolute or relative path against a throwaway origin.
pub(crate) fn scratch_url(path: &str) -> Result<Url, ApiError> {
    Url::parse(path)
        .or_else(|_| Url::parse(SCRATCH_BASE).and_then(|base| base.join(path)))
        .map_err(|e| invalid(path, e.to_string()))
}

fn relative(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    }
}

/// `base` followed by one encoded path segment per entry.
pub fn with_segments(base: &str, segments: &[&str]) -> Result<String, ApiError> {
    let mut url = scratch_url(base)?;
    url.path_segments_mut()
        .map_err(|()| invalid(base, "path cannot take segments"))?
        .pop_if_empty()
        .extend(segments);
    Ok(relative(&url))
}

/// Append form-encoded query parameters, keeping any query already on `path`.
pub fn with_query(path: &str, params: &[(&str, String)]) -> Result<String, ApiError> {
    let mut url = scratch_url(path)?;
    if !params.is_empty() {
        url.query_pairs_mut()
            .extend_pairs(params.iter().map(|(key, value)| (*key, value.as_str())));
    }
    Ok(relative(&url))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_values_are_encoded_and_existing_pairs_kept() {
        assert_eq!(
            with_query("/v2/entities?type=note", &[("sourceRecordId", "a b&c".into())]).unwrap(),
            "/v2/entities?type=note&sourceRecordId=a+b%26c"
        );
        assert_eq!(with_query("/companies", &[]).unwrap(), "/companies");
    }

    #[test]
    fn segments_cannot_escape_their_slot() {
        assert_eq!(
            with_segments("/companies", &["a/b?c#d"]).unwrap(),
            "/companies/a%2Fb%3Fc%23d"
        );
        assert_eq!(
            with_segments("/notes/", &["n-1", "links", "e 2"]).unwrap(),
            "/notes/n-1/links/e%202"
        );
    }
}
