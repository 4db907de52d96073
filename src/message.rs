//! Chat messages whose role and content live in secure memory.
//!
//! Callers describe content with the loosely-typed [`RawContentSpec`]
//! (a `type` tag plus byte fields). [`SecureMessage::new`] validates every
//! part into the closed [`ContentPart`] enum before allocating anything, so
//! a rejected message never touches the secure pool.

use core::fmt;

use serde::ser::{Error as _, Serialize, SerializeMap, SerializeStruct, Serializer};

use crate::alloc::SecurePool;
use crate::bytes::SecureBytes;
use crate::error::{Result, ValidationError};
use crate::outbound::SecureOutboundBuffer;

/// One value inside a [`RawContentSpec`].
#[derive(Debug, Clone, Copy)]
pub enum RawValue<'a> {
    Bytes(&'a [u8]),
    Str(&'a str),
    Object(&'a RawContentSpec<'a>),
}

impl<'a> From<&'a [u8]> for RawValue<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        Self::Bytes(bytes)
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for RawValue<'a> {
    fn from(bytes: &'a [u8; N]) -> Self {
        Self::Bytes(bytes)
    }
}

impl<'a> From<&'a str> for RawValue<'a> {
    fn from(s: &'a str) -> Self {
        Self::Str(s)
    }
}

impl<'a, 'b: 'a> From<&'a RawContentSpec<'b>> for RawValue<'a> {
    fn from(spec: &'a RawContentSpec<'b>) -> Self {
        Self::Object(spec)
    }
}

impl<'a> RawValue<'a> {
    fn as_bytes(&self) -> Option<&'a [u8]> {
        match *self {
            Self::Bytes(bytes) => Some(bytes),
            Self::Str(s) => Some(s.as_bytes()),
            Self::Object(_) => None,
        }
    }
}

/// Borrowed, dictionary-shaped description of one content part, as handed
/// over by a host binding.
///
/// Unknown keys are kept but ignored during validation.
#[derive(Debug, Clone, Default)]
pub struct RawContentSpec<'a> {
    fields: Vec<(&'a str, RawValue<'a>)>,
}

impl<'a> RawContentSpec<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or shadows) a field.
    pub fn field(mut self, key: &'a str, value: impl Into<RawValue<'a>>) -> Self {
        self.fields.push((key, value.into()));
        self
    }

    /// Looks up a field; the most recently added value wins.
    pub fn get(&self, key: &str) -> Option<RawValue<'a>> {
        self.fields
            .iter()
            .rev()
            .find(|(k, _)| *k == key)
            .map(|(_, value)| *value)
    }

    /// `{"type": "text", "text": text}`
    pub fn text(text: &'a [u8]) -> Self {
        Self::new().field("type", "text").field("text", text)
    }

    /// `{"type": "image_url", "image_url": {"url": url}}`, where `url_object`
    /// must have been built with [`RawContentSpec::url`].
    pub fn image_url(url_object: &'a RawContentSpec<'a>) -> Self {
        Self::new().field("type", "image_url").field("image_url", url_object)
    }

    /// The `{"url": url}` object nested in an `image_url` part.
    pub fn url(url: &'a [u8]) -> Self {
        Self::new().field("url", url)
    }
}

/// A content part after validation, still pointing at caller memory.
enum CheckedPart<'a> {
    Text(&'a [u8]),
    ImageUrl(&'a [u8]),
}

impl<'a> CheckedPart<'a> {
    fn check(spec: &RawContentSpec<'a>) -> Result<Self, ValidationError> {
        let tag = spec
            .get("type")
            .ok_or(ValidationError::MissingField("type"))?
            .as_bytes()
            .ok_or(ValidationError::InvalidField("type"))?;

        match tag {
            b"text" => {
                let text = required_bytes(spec, "text", "text")?;
                Ok(Self::Text(utf8(text, "text")?))
            }
            b"image_url" => {
                let object = match spec.get("image_url") {
                    Some(RawValue::Object(object)) => object,
                    Some(_) => return Err(ValidationError::InvalidField("image_url")),
                    None => return Err(ValidationError::MissingField("image_url")),
                };
                let url = required_bytes(object, "url", "image_url.url")?;
                Ok(Self::ImageUrl(utf8(url, "image_url.url")?))
            }
            other => Err(ValidationError::UnknownContentType(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }

    fn secure(&self, pool: &'static SecurePool) -> Result<ContentPart> {
        Ok(match *self {
            Self::Text(text) => ContentPart::Text {
                text: SecureBytes::from_bytes_in(text, pool)?,
            },
            Self::ImageUrl(url) => ContentPart::ImageUrl {
                url: SecureBytes::from_bytes_in(url, pool)?,
            },
        })
    }
}

fn required_bytes<'a>(
    spec: &RawContentSpec<'a>,
    key: &str,
    name: &'static str,
) -> Result<&'a [u8], ValidationError> {
    spec.get(key)
        .ok_or(ValidationError::MissingField(name))?
        .as_bytes()
        .ok_or(ValidationError::InvalidField(name))
}

fn utf8<'a>(bytes: &'a [u8], name: &'static str) -> Result<&'a [u8], ValidationError> {
    core::str::from_utf8(bytes)
        .map(|_| bytes)
        .map_err(|_| ValidationError::InvalidUtf8(name))
}

/// One typed unit of message content.
#[derive(Debug)]
pub enum ContentPart {
    Text { text: SecureBytes },
    ImageUrl { url: SecureBytes },
}

impl ContentPart {
    /// The wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::ImageUrl { .. } => "image_url",
        }
    }

    /// The secret payload of the part (text or URL).
    pub fn payload(&self) -> &SecureBytes {
        match self {
            Self::Text { text } => text,
            Self::ImageUrl { url } => url,
        }
    }
}

/// A role plus an ordered, non-empty list of content parts.
pub struct SecureMessage {
    role: SecureBytes,
    content: Vec<ContentPart>,
}

impl SecureMessage {
    /// Validates `content` and copies `role` and every part into secure
    /// memory from the global pool.
    pub fn new(role: &[u8], content: &[RawContentSpec<'_>]) -> Result<Self> {
        Self::new_in(role, content, SecurePool::global())
    }

    /// Same as [`SecureMessage::new`], allocating from `pool`.
    pub fn new_in(
        role: &[u8],
        content: &[RawContentSpec<'_>],
        pool: &'static SecurePool,
    ) -> Result<Self> {
        if content.is_empty() {
            return Err(ValidationError::EmptyContent.into());
        }
        utf8(role, "role")?;

        let checked = content
            .iter()
            .map(CheckedPart::check)
            .collect::<Result<Vec<_>, _>>()?;

        let role = SecureBytes::from_bytes_in(role, pool)?;
        let content = checked
            .iter()
            .map(|part| part.secure(pool))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { role, content })
    }

    #[inline]
    pub fn role(&self) -> &SecureBytes {
        &self.role
    }

    #[inline]
    pub fn parts(&self) -> &[ContentPart] {
        &self.content
    }

    /// Number of content parts.
    #[inline]
    pub fn len(&self) -> usize {
        self.content.len()
    }

    // Never true for a constructed message.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Appends the wire JSON of this message to `buffer`.
    ///
    /// The role and every payload go straight from their secure buffers into
    /// `buffer`, which grows (wiping its old regions) as needed.
    ///
    /// # Arguments
    ///
    /// * `buffer` - Destination; existing content is kept and the message is
    ///   written after it.
    ///
    /// # Returns
    ///
    /// * `Ok(())` once the whole object is written.
    /// * [`Error::Allocation`](crate::Error::Allocation) when `buffer` could
    ///   not grow. `buffer` is then left exactly as it was before the call.
    pub fn serialize_into(&self, buffer: &mut SecureOutboundBuffer) -> Result<()> {
        buffer.write_json(&WireMessage(self))
    }
}

impl fmt::Debug for SecureMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureMessage")
            .field("role", &self.role)
            .field("content", &self.content)
            .finish()
    }
}

/// Serializes a secure field as a JSON string straight from its read view.
struct SecretStr<'a>(&'a SecureBytes);

impl Serialize for SecretStr<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let view = self.0.borrow();
        let s = core::str::from_utf8(&view).map_err(|_| S::Error::custom("secret field is not UTF-8"))?;
        serializer.serialize_str(s)
    }
}

struct ImageUrlObject<'a>(&'a SecureBytes);

impl Serialize for ImageUrlObject<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("url", &SecretStr(self.0))?;
        map.end()
    }
}

struct WirePart<'a>(&'a ContentPart);

impl Serialize for WirePart<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("type", self.0.kind())?;
        match self.0 {
            ContentPart::Text { text } => map.serialize_entry("text", &SecretStr(text))?,
            ContentPart::ImageUrl { url } => map.serialize_entry("image_url", &ImageUrlObject(url))?,
        }
        map.end()
    }
}

struct WireParts<'a>(&'a [ContentPart]);

impl Serialize for WireParts<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter().map(WirePart))
    }
}

/// Wire form of a message: `{"role": .., "content": ..}`.
///
/// A message made of a single text part sends `content` as a plain string,
/// which every chat-completion API accepts; anything else sends the array
/// of typed parts.
pub(crate) struct WireMessage<'a>(pub(crate) &'a SecureMessage);

impl Serialize for WireMessage<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let message = self.0;
        let mut state = serializer.serialize_struct("SecureMessage", 2)?;
        state.serialize_field("role", &SecretStr(&message.role))?;

        match message.content.as_slice() {
            [ContentPart::Text { text }] => state.serialize_field("content", &SecretStr(text))?,
            parts => state.serialize_field("content", &WireParts(parts))?,
        }

        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::LockPolicy;
    use crate::error::Error;

    fn pool() -> &'static SecurePool {
        SecurePool::new(LockPolicy::BestEffort).leak()
    }

    fn to_json(message: &SecureMessage) -> serde_json::Value {
        let bytes = serde_json::to_vec(&WireMessage(message)).expect("Failed to serialize");
        serde_json::from_slice(&bytes).expect("Failed to parse")
    }

    #[test]
    fn test_text_and_image_parts_keep_order() {
        let pool = pool();
        let url = RawContentSpec::url(b"https://example.com/cat.png");
        let content = [
            RawContentSpec::text(b"What is in this image?"),
            RawContentSpec::image_url(&url),
        ];

        let message = SecureMessage::new_in(b"user", &content, pool).expect("Failed to new_in()");

        assert_eq!(&*message.role().borrow(), b"user");
        assert_eq!(message.len(), 2);
        assert_eq!(message.parts()[0].kind(), "text");
        assert_eq!(&*message.parts()[0].payload().borrow(), b"What is in this image?");
        assert_eq!(message.parts()[1].kind(), "image_url");
        assert_eq!(
            &*message.parts()[1].payload().borrow(),
            b"https://example.com/cat.png"
        );
        assert_eq!(pool.stats().live_allocations, 3);
    }

    #[test]
    fn test_unknown_type_allocates_nothing() {
        let pool = pool();
        let content = [
            RawContentSpec::text(b"fine"),
            RawContentSpec::new().field("type", "unknown").field("text", b"x"),
        ];

        let result = SecureMessage::new_in(b"user", &content, pool);

        assert!(matches!(
            result,
            Err(Error::Validation(ValidationError::UnknownContentType(ref tag))) if tag == "unknown"
        ));
        assert_eq!(pool.stats().total_allocations, 0);
    }

    #[test]
    fn test_missing_fields() {
        let pool = pool();
        let cases = [
            (RawContentSpec::new().field("text", b"no tag"), "type"),
            (RawContentSpec::new().field("type", "text"), "text"),
            (RawContentSpec::new().field("type", "image_url"), "image_url"),
        ];

        for (spec, field) in cases {
            let result = SecureMessage::new_in(b"user", &[spec], pool);
            assert!(matches!(
                result,
                Err(Error::Validation(ValidationError::MissingField(f))) if f == field
            ));
        }

        let empty_object = RawContentSpec::new();
        let spec = RawContentSpec::image_url(&empty_object);
        assert!(matches!(
            SecureMessage::new_in(b"user", &[spec], pool),
            Err(Error::Validation(ValidationError::MissingField("image_url.url")))
        ));

        assert_eq!(pool.stats().total_allocations, 0);
    }

    #[test]
    fn test_wrong_shapes_and_encoding() {
        let pool = pool();
        let nested = RawContentSpec::url(b"u");

        let text_as_object = RawContentSpec::new().field("type", "text").field("text", &nested);
        assert!(matches!(
            SecureMessage::new_in(b"user", &[text_as_object], pool),
            Err(Error::Validation(ValidationError::InvalidField("text")))
        ));

        let url_as_bytes = RawContentSpec::new()
            .field("type", "image_url")
            .field("image_url", b"https://x");
        assert!(matches!(
            SecureMessage::new_in(b"user", &[url_as_bytes], pool),
            Err(Error::Validation(ValidationError::InvalidField("image_url")))
        ));

        let not_utf8 = RawContentSpec::text(b"\xC3\x28");
        assert!(matches!(
            SecureMessage::new_in(b"user", &[not_utf8], pool),
            Err(Error::Validation(ValidationError::InvalidUtf8("text")))
        ));

        assert!(matches!(
            SecureMessage::new_in(b"\xFF", &[RawContentSpec::text(b"hi")], pool),
            Err(Error::Validation(ValidationError::InvalidUtf8("role")))
        ));

        assert_eq!(pool.stats().total_allocations, 0);
    }

    #[test]
    fn test_empty_content_rejected() {
        let pool = pool();
        assert!(matches!(
            SecureMessage::new_in(b"user", &[], pool),
            Err(Error::Validation(ValidationError::EmptyContent))
        ));
    }

    #[test]
    fn test_extra_fields_are_ignored() {
        let pool = pool();
        let spec = RawContentSpec::text(b"hi").field("cache_control", "ephemeral");

        let message = SecureMessage::new_in(b"user", &[spec], pool).expect("Failed to new_in()");
        assert_eq!(&*message.parts()[0].payload().borrow(), b"hi");
    }

    #[test]
    fn test_serialize_into_grows_small_buffer() {
        let pool = pool();
        let text = [b'a'; 300];
        let message = SecureMessage::new_in(b"user", &[RawContentSpec::text(&text)], pool)
            .expect("Failed to new_in()");
        let mut buffer = SecureOutboundBuffer::with_capacity_in(8, pool).expect("Failed to allocate");
        let initial_capacity = buffer.capacity();

        message.serialize_into(&mut buffer).expect("Failed to serialize_into()");

        assert!(buffer.capacity() > initial_capacity);
        let json: serde_json::Value = serde_json::from_slice(&buffer.borrow()).expect("Failed to parse");
        assert_eq!(
            json,
            serde_json::json!({ "role": "user", "content": "a".repeat(300) })
        );

        let stats = pool.stats();
        assert_eq!(stats.verified_zero_releases, stats.total_releases);
    }

    #[test]
    fn test_serialize_into_appends_after_existing_content() {
        let pool = pool();
        let url = RawContentSpec::url(b"https://example.com/a.png");
        let message = SecureMessage::new_in(
            b"user",
            &[RawContentSpec::text(b"look"), RawContentSpec::image_url(&url)],
            pool,
        )
        .expect("Failed to new_in()");
        let mut buffer = SecureOutboundBuffer::with_capacity_in(0, pool).expect("Failed to allocate");
        buffer.extend_from_slice(b"[").expect("Failed to extend");

        message.serialize_into(&mut buffer).expect("Failed to serialize_into()");
        buffer.extend_from_slice(b"]").expect("Failed to extend");

        let json: serde_json::Value = serde_json::from_slice(&buffer.borrow()).expect("Failed to parse");
        assert_eq!(
            json,
            serde_json::json!([{
                "role": "user",
                "content": [
                    { "type": "text", "text": "look" },
                    { "type": "image_url", "image_url": { "url": "https://example.com/a.png" } }
                ]
            }])
        );
    }

    #[test]
    fn test_single_text_serializes_as_string() {
        let message = SecureMessage::new_in(b"system", &[RawContentSpec::text(b"Be \"brief\"")], pool())
            .expect("Failed to new_in()");

        assert_eq!(
            to_json(&message),
            serde_json::json!({ "role": "system", "content": "Be \"brief\"" })
        );
    }

    #[test]
    fn test_multi_part_serializes_as_array() {
        let url = RawContentSpec::url(b"https://example.com/a.png");
        let message = SecureMessage::new_in(
            b"user",
            &[RawContentSpec::text(b"look"), RawContentSpec::image_url(&url)],
            pool(),
        )
        .expect("Failed to new_in()");

        assert_eq!(
            to_json(&message),
            serde_json::json!({
                "role": "user",
                "content": [
                    { "type": "text", "text": "look" },
                    { "type": "image_url", "image_url": { "url": "https://example.com/a.png" } }
                ]
            })
        );
    }

    #[test]
    fn test_single_image_serializes_as_array() {
        let url = RawContentSpec::url(b"https://example.com/a.png");
        let message = SecureMessage::new_in(b"user", &[RawContentSpec::image_url(&url)], pool())
            .expect("Failed to new_in()");

        assert!(to_json(&message)["content"].is_array());
    }

    #[test]
    fn test_drop_releases_every_part() {
        let pool = pool();
        let url = RawContentSpec::url(b"https://example.com/a.png");
        let message = SecureMessage::new_in(
            b"user",
            &[RawContentSpec::text(b"one"), RawContentSpec::image_url(&url)],
            pool,
        )
        .expect("Failed to new_in()");

        drop(message);

        let stats = pool.stats();
        assert_eq!(stats.live_allocations, 0);
        assert_eq!(stats.total_releases, 3);
        assert_eq!(stats.verified_zero_releases, 3);
    }
}
