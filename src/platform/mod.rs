pub mod dispatch;
pub mod slack;
pub mod telegram;
pub mod vk;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The chat platforms this crate can bridge.
///
/// The `Display`/`FromStr` spellings double as the storage representation,
/// so changing them invalidates existing user and dedup records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    #[serde(rename = "tg")]
    Telegram,
    Vk,
    Slack,
}

impl fmt::Display for PlatformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformKind::Telegram => write!(f, "tg"),
            PlatformKind::Vk => write!(f, "vk"),
            PlatformKind::Slack => write!(f, "slack"),
        }
    }
}

impl FromStr for PlatformKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tg" => Ok(PlatformKind::Telegram),
            "vk" => Ok(PlatformKind::Vk),
            "slack" => Ok(PlatformKind::Slack),
            other => Err(anyhow::anyhow!("unknown platform: {other}")),
        }
    }
}

/// An inbound attachment resolved to something downloadable.
#[derive(Debug, Clone)]
pub struct FileRef {
    /// Retrievable URL for the attachment contents.
    pub url: String,
    /// Filename to store the attachment under. Synthesized from a timestamp
    /// when the platform provides no stable name.
    pub filename: String,
    /// The platform-provided original filename, when there is one.
    pub origin: Option<String>,
    /// File extension without the dot.
    pub ext: Option<String>,
}

/// One inbound interaction, normalized across platforms.
///
/// Produced once per raw platform event and consumed by the step engine.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub platform: PlatformKind,
    /// Stable per-platform event id used for deduplication. `None` disables
    /// dedup for this event.
    pub event_id: Option<String>,
    pub chat_id: String,
    pub user_id: String,
    /// Matched command name (without prefix), if the event carried one.
    pub command: Option<String>,
    pub text: Option<String>,
    pub reply_id: Option<String>,
    /// Raw callback value (button press data or a command's inline argument)
    /// that may name a previously minted token.
    pub callback_token: Option<String>,
    /// Payload recovered from `callback_token`, filled in by the engine.
    pub payload: Option<serde_json::Value>,
    pub files: Vec<FileRef>,
}

impl InboundEvent {
    pub fn new(
        platform: PlatformKind,
        chat_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            event_id: None,
            chat_id: chat_id.into(),
            user_id: user_id.into(),
            command: None,
            text: None,
            reply_id: None,
            callback_token: None,
            payload: None,
            files: Vec::new(),
        }
    }
}

/// Where the bytes of an outbound photo or document come from.
#[derive(Debug, Clone)]
pub enum FileSource {
    Url(String),
    Path(PathBuf),
    Bytes { data: Vec<u8>, filename: String },
}

impl FileSource {
    /// Best-known filename for this source, if any.
    pub fn filename(&self) -> Option<String> {
        match self {
            FileSource::Url(url) => url
                .rsplit('/')
                .next()
                .filter(|n| !n.is_empty())
                .map(str::to_string),
            FileSource::Path(path) => path.file_name().map(|n| n.to_string_lossy().into_owned()),
            FileSource::Bytes { filename, .. } => Some(filename.clone()),
        }
    }
}

/// One button of an outbound keyboard, before tokenization.
#[derive(Debug, Clone)]
pub struct KeyboardItem {
    pub label: String,
    /// Platform-specific button styling hint (e.g. a VK button color).
    pub intent: Option<String>,
    /// Arbitrary payload recovered on the next interaction. Replaced by an
    /// opaque token before the platform ever sees it.
    pub payload: Option<serde_json::Value>,
}

/// A keyboard button after its payload has been swapped for a token.
#[derive(Debug, Clone)]
pub struct SendButton {
    pub label: String,
    pub intent: Option<String>,
    pub token: Option<String>,
}

/// A platform-independent outbound message.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub text: String,
    pub photo: Option<FileSource>,
    pub file: Option<FileSource>,
    pub keyboard: Vec<KeyboardItem>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// A platform-visible command derived from the step table.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Display name: the bare command for capitalized VK-style commands,
    /// otherwise the slash-prefixed form.
    pub name: String,
    /// The command as matched against inbound events.
    pub command: String,
    pub description: String,
}

/// Callback invoked by adapters once per normalized inbound event.
/// The receiving side spawns a task per event, so this must not block.
pub type EventHandler = Arc<dyn Fn(InboundEvent) + Send + Sync>;

/// Contract every platform adapter implements.
///
/// Inbound: `listen` runs the platform's event loop forever, normalizing each
/// raw event and passing it to the handler. Outbound: the send calls receive
/// keyboards whose payloads are already tokenized; adapters only map them into
/// the platform's native button representation.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn kind(&self) -> PlatformKind;

    /// Run the inbound event loop. Returns only on a fatal transport error.
    async fn listen(&self, handler: EventHandler) -> Result<()>;

    async fn send_text(&self, chat_id: &str, text: &str, keyboard: &[SendButton]) -> Result<()>;

    async fn send_photo(
        &self,
        chat_id: &str,
        text: &str,
        file: &FileSource,
        keyboard: &[SendButton],
    ) -> Result<()>;

    async fn send_file(
        &self,
        chat_id: &str,
        text: &str,
        file: &FileSource,
        keyboard: &[SendButton],
    ) -> Result<()>;

    /// Advertise the step table's commands to the platform. Best-effort.
    async fn set_commands(&self, commands: &[CommandSpec]) -> Result<()>;
}
