//! Request-size token estimation.
//!
//! Local backends expose no tokenizer endpoint, so counts are estimated from
//! character length at roughly four characters per token. The client only
//! uses these numbers for context-budget display, not billing.

use crate::messages::anthropic::CountTokensRequest;

const CHARS_PER_TOKEN: usize = 4;

/// Estimate the token count of a string.
pub(crate) fn estimate_str(text: &str) -> u32 {
    estimate_chars(text.chars().count())
}

/// Estimate the token count of a character length.
pub(crate) fn estimate_chars(chars: usize) -> u32 {
    chars.div_ceil(CHARS_PER_TOKEN) as u32
}

/// Estimate input tokens for a count-tokens request from its serialized size.
pub(crate) fn count_request_tokens(request: &CountTokensRequest) -> u32 {
    let serialized = serde_json::to_string(request).unwrap_or_default();
    estimate_str(&serialized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rounds_up_partial_tokens() {
        assert_eq!(estimate_str(""), 0);
        assert_eq!(estimate_str("ab"), 1);
        assert_eq!(estimate_str("abcd"), 1);
        assert_eq!(estimate_str("abcde"), 2);
        assert_eq!(estimate_chars(4000), 1000);
    }

    #[test]
    fn counts_serialized_request_size() {
        let request: CountTokensRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "What is 2+2?"}]
        }))
        .unwrap();

        let tokens = count_request_tokens(&request);
        assert!(tokens > 10, "serialized request should be non-trivial, got {tokens}");
    }
}
