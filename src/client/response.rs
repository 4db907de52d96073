//! Turning a raw response body into the value handed back to the caller.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::alloc::SecurePool;
use crate::bytes::SecureBytes;
use crate::error::{Error, Result};

/// What `chat_completion` returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFormat {
    /// The response body exactly as the transport delivered it.
    #[default]
    Raw,
    /// `choices[0].message.content` of a chat-completion JSON body. A null
    /// or absent content yields an empty buffer.
    MessageContent,
}

#[derive(Deserialize)]
struct Completion<'a> {
    #[serde(borrow)]
    choices: Vec<Choice<'a>>,
}

#[derive(Deserialize)]
struct Choice<'a> {
    #[serde(borrow)]
    message: ChoiceMessage<'a>,
}

#[derive(Deserialize)]
struct ChoiceMessage<'a> {
    #[serde(borrow, default)]
    content: Option<Content<'a>>,
}

/// Borrows from the locked body unless the JSON string had escapes, in
/// which case the unescaped copy is wiped on drop.
#[derive(Deserialize)]
struct Content<'a>(#[serde(borrow)] Cow<'a, str>);

impl Drop for Content<'_> {
    fn drop(&mut self) {
        if let Cow::Owned(s) = &mut self.0 {
            s.zeroize();
        }
    }
}

pub(crate) fn finish(body: SecureBytes, format: ResponseFormat, pool: &'static SecurePool) -> Result<SecureBytes> {
    match format {
        ResponseFormat::Raw => Ok(body),
        ResponseFormat::MessageContent => extract_message_content(&body, pool),
    }
}

fn extract_message_content(body: &SecureBytes, pool: &'static SecurePool) -> Result<SecureBytes> {
    let view = body.borrow();
    let completion: Completion<'_> = serde_json::from_slice(&view).map_err(|err| Error::from_json(&err))?;

    let choice = completion.choices.first().ok_or(Error::EmptyResponse)?;
    let content: &[u8] = match &choice.message.content {
        Some(Content(text)) => text.as_bytes(),
        None => b"",
    };

    Ok(SecureBytes::from_bytes_in(content, pool)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::LockPolicy;

    fn pool() -> &'static SecurePool {
        SecurePool::new(LockPolicy::BestEffort).leak()
    }

    fn extract(json: &str) -> Result<SecureBytes> {
        let pool = pool();
        let body = SecureBytes::from_bytes_in(json.as_bytes(), pool).expect("Failed to from_bytes_in()");
        finish(body, ResponseFormat::MessageContent, pool)
    }

    #[test]
    fn test_raw_passes_body_through() {
        let pool = pool();
        let body = SecureBytes::from_bytes_in(b"pong", pool).expect("Failed to from_bytes_in()");
        let out = finish(body, ResponseFormat::Raw, pool).expect("Failed to finish()");

        assert_eq!(&*out.borrow(), b"pong");
        assert_eq!(pool.stats().total_allocations, 1);
    }

    #[test]
    fn test_extracts_first_choice() {
        let out = extract(
            r#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"hello"}},
                {"index":1,"message":{"role":"assistant","content":"other"}}]}"#,
        )
        .expect("Failed to extract");

        assert_eq!(&*out.borrow(), b"hello");
    }

    #[test]
    fn test_extracts_escaped_content() {
        let out = extract(r#"{"choices":[{"message":{"content":"line\n\"quoted\" é"}}]}"#)
            .expect("Failed to extract");

        assert_eq!(&*out.borrow(), "line\n\"quoted\" é".as_bytes());
    }

    #[test]
    fn test_null_content_is_empty() {
        let out = extract(r#"{"choices":[{"message":{"content":null,"tool_calls":[]}}]}"#)
            .expect("Failed to extract");
        assert!(out.is_empty());
    }

    #[test]
    fn test_no_choices() {
        assert!(matches!(extract(r#"{"choices":[]}"#), Err(Error::EmptyResponse)));
    }

    #[test]
    fn test_malformed_body() {
        let err = extract(r#"{"choices": [ {"message": "#).expect_err("truncated body");
        assert!(matches!(err, Error::Parse { category: "eof", .. }));

        let err = extract(r#"{"choices": "sk-secret-value"}"#).expect_err("wrong shape");
        assert!(matches!(err, Error::Parse { category: "data", .. }));
        assert!(!err.to_string().contains("sk-secret-value"));
    }

    #[test]
    fn test_intermediate_body_is_released() {
        let pool = pool();
        let body = SecureBytes::from_bytes_in(br#"{"choices":[{"message":{"content":"ok"}}]}"#, pool)
            .expect("Failed to from_bytes_in()");

        let out = finish(body, ResponseFormat::MessageContent, pool).expect("Failed to finish()");

        assert_eq!(&*out.borrow(), b"ok");
        assert_eq!(pool.stats().live_allocations, 1);
    }
}
