use axum::http::HeaderMap;

/// Runtime context extracted from the incoming request headers.
///
/// The client sends its usual vendor headers. Their content does not steer
/// translation; they are surfaced in logs so captured sessions show what the
/// client asked for. The client's credential is handled separately: monitor
/// mode forwards it verbatim from the raw headers.
#[derive(Debug, Clone, Default)]
pub(crate) struct RequestContext {
    /// `anthropic-version` header.
    pub anthropic_version: Option<String>,

    /// `anthropic-beta` header.
    pub beta: Option<String>,
}

pub(crate) fn extract_context(headers: &HeaderMap) -> RequestContext {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    };

    RequestContext {
        anthropic_version: header_str("anthropic-version"),
        beta: header_str("anthropic-beta"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extracts_version_and_beta() {
        let mut headers = HeaderMap::new();
        headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        headers.insert("anthropic-beta", HeaderValue::from_static("tools-2024"));

        let context = extract_context(&headers);

        assert_eq!(context.anthropic_version.as_deref(), Some("2023-06-01"));
        assert_eq!(context.beta.as_deref(), Some("tools-2024"));
    }

    #[test]
    fn missing_headers_stay_absent() {
        let context = extract_context(&HeaderMap::new());
        assert!(context.anthropic_version.is_none());
        assert!(context.beta.is_none());
    }
}
