//! Turning file content into messages.
//!
//! A [`BuilderSelector`] maps the primary media type of a file to a
//! [`MessageBuilder`]. Types without a registered builder go to the default
//! builder, which is [`XmlBuilder`] unless configured otherwise.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use encoding_rs::Encoding;
use filepoll_vfs::{ContentReader, FileObject, VfsError};
use mime_guess::mime::Mime;
use quick_xml::events::Event;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BuildError;

/// Media type used for structured XML messages.
pub const TEXT_XML: &str = "text/xml";

/// Media type used for plain text messages.
pub const TEXT_PLAIN: &str = "text/plain";

/// Media type used for opaque binary messages.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// A media type split into the part used for builder lookup and the
/// character set parameter, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentType {
    primary: String,
    charset: Option<String>,
}

impl ContentType {
    /// Parse a media type such as `text/xml; charset=UTF-8`.
    ///
    /// Strict media types are normalized; anything else keeps the text
    /// before the first `;` as the primary type.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        let primary = match value.parse::<Mime>() {
            Ok(mime) => mime.essence_str().to_ascii_lowercase(),
            Err(_) => value
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase(),
        };
        Self {
            primary,
            charset: charset_param(value),
        }
    }

    /// A media type without parameters.
    pub fn new(primary: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            charset: None,
        }
    }

    /// Infer a media type from a file extension.
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "xml" => Some(Self::new(TEXT_XML)),
            "txt" => Some(Self::new(TEXT_PLAIN)),
            other => mime_guess::from_ext(other)
                .first()
                .map(|mime| Self::new(mime.essence_str())),
        }
    }

    /// The type used for builder lookup, e.g. `text/xml`.
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// The declared character set, as written.
    pub fn charset(&self) -> Option<&str> {
        self.charset.as_deref()
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.charset {
            Some(charset) => write!(f, "{}; charset={}", self.primary, charset),
            None => f.write_str(&self.primary),
        }
    }
}

fn charset_param(value: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|param| {
        let (name, val) = param.split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("charset")
            .then(|| val.trim().trim_matches('"').to_string())
            .filter(|charset| !charset.is_empty())
    })
}

/// Lazily read content owned by the transport.
///
/// Nothing is read until a reader is opened. Every reader is tracked by the
/// file's content guard, so the transport can close whatever is left open
/// once dispatch finishes.
#[derive(Clone)]
pub struct ManagedSource {
    file: Arc<dyn FileObject>,
}

impl ManagedSource {
    /// Wrap a file.
    pub fn new(file: Arc<dyn FileObject>) -> Self {
        Self { file }
    }

    /// URI of the underlying file.
    pub fn uri(&self) -> String {
        self.file.name().uri()
    }

    /// Size of the content, if the backend knows it.
    pub fn len(&self) -> Option<u64> {
        self.file.content().size().ok()
    }

    /// Whether the content is known to be empty.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Open a new tracked reader over the content.
    pub fn open(&self) -> Result<ContentReader, VfsError> {
        self.file.content().open_read()
    }

    /// Read the whole content.
    pub fn read_all(&self) -> Result<Bytes, BuildError> {
        read_to_bytes(self.open()?)
    }

    /// Close every stream opened through this source.
    pub fn close(&self) -> Result<(), VfsError> {
        self.file.content().close_all()
    }
}

impl std::fmt::Debug for ManagedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedSource")
            .field("uri", &self.uri())
            .finish()
    }
}

/// How content is handed to a builder.
#[derive(Debug)]
pub enum MessageSource {
    /// An open stream positioned at the start of the content.
    Stream(ContentReader),

    /// A source the builder may read lazily, or pass through untouched.
    Managed(ManagedSource),
}

impl MessageSource {
    /// Read the whole content, closing the stream afterwards.
    pub fn read_all(self) -> Result<Bytes, BuildError> {
        match self {
            Self::Stream(reader) => read_to_bytes(reader),
            Self::Managed(source) => source.read_all(),
        }
    }
}

fn read_to_bytes(mut reader: ContentReader) -> Result<Bytes, BuildError> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    reader.close();
    Ok(Bytes::from(buf))
}

/// Body of a built message.
#[derive(Debug, Clone)]
pub enum MessageBody {
    /// A well-formed XML document.
    Xml {
        /// Name of the document element.
        root: String,
        /// The decoded document.
        text: String,
    },

    /// Decoded text.
    Text(String),

    /// Raw bytes.
    Binary(Bytes),

    /// Content left in place for the engine to read.
    Streamed(ManagedSource),
}

/// A message ready for dispatch.
#[derive(Debug, Clone)]
pub struct Message {
    /// The payload.
    pub body: MessageBody,

    /// Character set declared by the content type, as written.
    pub charset: Option<String>,
}

impl Message {
    /// Read a streamed body into memory so the message no longer depends
    /// on the file. Other bodies are returned as they are.
    pub fn detach(self) -> Result<Self, BuildError> {
        let body = match self.body {
            MessageBody::Streamed(source) => {
                let bytes = source.read_all()?;
                source.close()?;
                MessageBody::Binary(bytes)
            }
            body => body,
        };
        Ok(Self {
            body,
            charset: self.charset,
        })
    }
}

/// Converts content of one family of media types into messages.
pub trait MessageBuilder: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Whether the builder accepts a [`MessageSource::Managed`] source
    /// without reading it up front.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Build a message.
    fn build(
        &self,
        source: MessageSource,
        content_type: Option<&ContentType>,
    ) -> Result<Message, BuildError>;
}

/// Decode `bytes` using the declared charset, UTF-8 by default. A leading
/// byte order mark overrides the label.
fn decode(bytes: &[u8], content_type: Option<&ContentType>) -> Result<String, BuildError> {
    let encoding = match content_type.and_then(ContentType::charset) {
        Some(label) => Encoding::for_label(label.as_bytes())
            .ok_or_else(|| BuildError::UnsupportedCharset(label.to_string()))?,
        None => encoding_rs::UTF_8,
    };
    let (text, used, had_errors) = encoding.decode(bytes);
    if had_errors {
        return Err(BuildError::Malformed(format!(
            "content is not valid {}",
            used.name()
        )));
    }
    Ok(text.into_owned())
}

fn declared_charset(content_type: Option<&ContentType>) -> Option<String> {
    content_type.and_then(ContentType::charset).map(str::to_string)
}

/// Builds structured XML messages. Content must be a single well-formed
/// document.
#[derive(Debug, Default)]
pub struct XmlBuilder;

impl XmlBuilder {
    fn root_element(text: &str) -> Result<String, BuildError> {
        let mut reader = quick_xml::Reader::from_str(text);
        let mut root: Option<String> = None;
        let mut depth = 0usize;

        loop {
            let event = reader
                .read_event()
                .map_err(|e| BuildError::Malformed(e.to_string()))?;
            match event {
                Event::Start(start) => {
                    if depth == 0 {
                        Self::set_root(&mut root, start.name().as_ref())?;
                    }
                    depth += 1;
                }
                Event::Empty(empty) => {
                    if depth == 0 {
                        Self::set_root(&mut root, empty.name().as_ref())?;
                    }
                }
                Event::End(_) => depth = depth.saturating_sub(1),
                Event::Eof => break,
                _ => {}
            }
        }

        if depth != 0 {
            return Err(BuildError::Malformed("unclosed element".to_string()));
        }
        root.ok_or_else(|| BuildError::Malformed("no document element".to_string()))
    }

    fn set_root(root: &mut Option<String>, name: &[u8]) -> Result<(), BuildError> {
        if root.is_some() {
            return Err(BuildError::Malformed(
                "more than one document element".to_string(),
            ));
        }
        *root = Some(String::from_utf8_lossy(name).into_owned());
        Ok(())
    }
}

impl MessageBuilder for XmlBuilder {
    fn name(&self) -> &'static str {
        "xml"
    }

    fn build(
        &self,
        source: MessageSource,
        content_type: Option<&ContentType>,
    ) -> Result<Message, BuildError> {
        let bytes = source.read_all()?;
        let text = decode(&bytes, content_type)?;
        let root = Self::root_element(&text)?;
        Ok(Message {
            body: MessageBody::Xml { root, text },
            charset: declared_charset(content_type),
        })
    }
}

/// Builds plain text messages.
#[derive(Debug, Default)]
pub struct PlainTextBuilder;

impl MessageBuilder for PlainTextBuilder {
    fn name(&self) -> &'static str {
        "text"
    }

    fn build(
        &self,
        source: MessageSource,
        content_type: Option<&ContentType>,
    ) -> Result<Message, BuildError> {
        let bytes = source.read_all()?;
        let text = decode(&bytes, content_type)?;
        Ok(Message {
            body: MessageBody::Text(text),
            charset: declared_charset(content_type),
        })
    }
}

/// Builds opaque binary messages. A managed source is passed through
/// unread.
#[derive(Debug, Default)]
pub struct BinaryBuilder;

impl MessageBuilder for BinaryBuilder {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn build(
        &self,
        source: MessageSource,
        content_type: Option<&ContentType>,
    ) -> Result<Message, BuildError> {
        let body = match source {
            MessageSource::Managed(source) => MessageBody::Streamed(source),
            MessageSource::Stream(reader) => MessageBody::Binary(read_to_bytes(reader)?),
        };
        Ok(Message {
            body,
            charset: declared_charset(content_type),
        })
    }
}

/// Lookup table from primary media type to builder.
pub struct BuilderSelector {
    builders: HashMap<String, Arc<dyn MessageBuilder>>,
    default: Arc<dyn MessageBuilder>,
}

impl BuilderSelector {
    /// A selector with no registered types and the given default.
    pub fn empty(default: Arc<dyn MessageBuilder>) -> Self {
        Self {
            builders: HashMap::new(),
            default,
        }
    }

    /// Register a builder for a primary media type, replacing any previous
    /// one.
    pub fn register(&mut self, primary: impl Into<String>, builder: Arc<dyn MessageBuilder>) {
        self.builders
            .insert(primary.into().to_ascii_lowercase(), builder);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_builder(
        mut self,
        primary: impl Into<String>,
        builder: Arc<dyn MessageBuilder>,
    ) -> Self {
        self.register(primary, builder);
        self
    }

    /// The builder for `content_type`, or the default.
    pub fn select(&self, content_type: Option<&ContentType>) -> Arc<dyn MessageBuilder> {
        let Some(content_type) = content_type else {
            return self.default.clone();
        };
        match self.builders.get(content_type.primary()) {
            Some(builder) => builder.clone(),
            None => {
                debug!(
                    "No builder for {}, using {}",
                    content_type.primary(),
                    self.default.name()
                );
                self.default.clone()
            }
        }
    }

    /// Open `file` the way the selected builder wants it.
    pub fn source_for(
        &self,
        builder: &dyn MessageBuilder,
        file: &Arc<dyn FileObject>,
        streaming: bool,
    ) -> Result<MessageSource, VfsError> {
        if streaming && builder.supports_streaming() {
            Ok(MessageSource::Managed(ManagedSource::new(file.clone())))
        } else {
            Ok(MessageSource::Stream(file.content().open_read()?))
        }
    }
}

impl Default for BuilderSelector {
    fn default() -> Self {
        Self::empty(Arc::new(XmlBuilder))
            .with_builder(TEXT_XML, Arc::new(XmlBuilder))
            .with_builder("application/xml", Arc::new(XmlBuilder))
            .with_builder(TEXT_PLAIN, Arc::new(PlainTextBuilder))
            .with_builder(OCTET_STREAM, Arc::new(BinaryBuilder))
    }
}

impl std::fmt::Debug for BuilderSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&str> = self.builders.keys().map(String::as_str).collect();
        types.sort_unstable();
        f.debug_struct("BuilderSelector")
            .field("types", &types)
            .field("default", &self.default.name())
            .finish()
    }
}
