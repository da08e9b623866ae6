use std::collections::HashMap;
use std::sync::Arc;

use tracing::{error, warn};

use crate::platform::{
    CommandSpec, KeyboardItem, OutboundMessage, PlatformAdapter, PlatformKind, SendButton,
};
use crate::store::tokens::CallbackTokenStore;

/// Routes canonical outbound messages to the right platform adapter.
///
/// The one piece of outbound behavior all platforms share lives here:
/// keyboard payloads are swapped for opaque tokens before any adapter builds
/// its native button list. Sends are fire-and-forget; every failure is logged
/// and swallowed so the step engine never observes delivery problems.
pub struct Dispatcher {
    adapters: HashMap<PlatformKind, Arc<dyn PlatformAdapter>>,
    tokens: CallbackTokenStore,
}

impl Dispatcher {
    pub fn new(adapters: Vec<Arc<dyn PlatformAdapter>>, tokens: CallbackTokenStore) -> Self {
        let adapters = adapters
            .into_iter()
            .map(|adapter| (adapter.kind(), adapter))
            .collect();
        Self { adapters, tokens }
    }

    pub fn is_enabled(&self, platform: PlatformKind) -> bool {
        self.adapters.contains_key(&platform)
    }

    /// Send a canonical message to a chat. Never fails from the caller's
    /// perspective.
    pub async fn send(&self, platform: PlatformKind, chat_id: &str, message: OutboundMessage) {
        let Some(adapter) = self.adapters.get(&platform) else {
            // Dispatching to a platform that was never configured is a
            // programming error upstream, not something to recover from here.
            error!("No adapter configured for platform {}", platform);
            return;
        };

        let keyboard = self.tokenize_keyboard(&message.keyboard).await;

        let result = if let Some(photo) = &message.photo {
            adapter
                .send_photo(chat_id, &message.text, photo, &keyboard)
                .await
        } else if let Some(file) = &message.file {
            adapter
                .send_file(chat_id, &message.text, file, &keyboard)
                .await
        } else {
            adapter.send_text(chat_id, &message.text, &keyboard).await
        };

        if let Err(e) = result {
            error!("Failed to send to {} chat {}: {:#}", platform, chat_id, e);
        }
    }

    /// Advertise commands on every platform. A platform that rejects the
    /// call logs and does not block the others.
    pub async fn register_commands(&self, commands: &[CommandSpec]) {
        for adapter in self.adapters.values() {
            if let Err(e) = adapter.set_commands(commands).await {
                warn!(
                    "Failed to register commands on {}: {:#}",
                    adapter.kind(),
                    e
                );
            }
        }
    }

    /// Mint a token for every button payload, concurrently. A button whose
    /// payload cannot be tokenized goes out without one.
    async fn tokenize_keyboard(&self, keyboard: &[KeyboardItem]) -> Vec<SendButton> {
        futures::future::join_all(keyboard.iter().map(|item| async {
            let token = match &item.payload {
                Some(payload) => match self.tokens.add(payload).await {
                    Ok(token) => Some(token),
                    Err(e) => {
                        error!("Failed to tokenize button '{}': {:#}", item.label, e);
                        None
                    }
                },
                None => None,
            };
            SendButton {
                label: item.label.clone(),
                intent: item.intent.clone(),
                token,
            }
        }))
        .await
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::platform::{EventHandler, FileSource};
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone)]
    pub(crate) struct SentMessage {
        pub chat_id: String,
        pub text: String,
        pub keyboard: Vec<SendButton>,
    }

    /// Adapter that records sends instead of talking to a network.
    pub(crate) struct RecordingAdapter {
        pub kind: PlatformKind,
        pub sent: Mutex<Vec<SentMessage>>,
        pub fail_sends: bool,
    }

    impl RecordingAdapter {
        pub fn new(kind: PlatformKind) -> Self {
            Self {
                kind,
                sent: Mutex::new(Vec::new()),
                fail_sends: false,
            }
        }
    }

    #[async_trait]
    impl PlatformAdapter for RecordingAdapter {
        fn kind(&self) -> PlatformKind {
            self.kind
        }

        async fn listen(&self, _handler: EventHandler) -> Result<()> {
            Ok(())
        }

        async fn send_text(
            &self,
            chat_id: &str,
            text: &str,
            keyboard: &[SendButton],
        ) -> Result<()> {
            if self.fail_sends {
                bail!("simulated send failure");
            }
            self.sent.lock().await.push(SentMessage {
                chat_id: chat_id.to_string(),
                text: text.to_string(),
                keyboard: keyboard.to_vec(),
            });
            Ok(())
        }

        async fn send_photo(
            &self,
            chat_id: &str,
            text: &str,
            _file: &FileSource,
            keyboard: &[SendButton],
        ) -> Result<()> {
            self.send_text(chat_id, text, keyboard).await
        }

        async fn send_file(
            &self,
            chat_id: &str,
            text: &str,
            _file: &FileSource,
            keyboard: &[SendButton],
        ) -> Result<()> {
            self.send_text(chat_id, text, keyboard).await
        }

        async fn set_commands(&self, _commands: &[CommandSpec]) -> Result<()> {
            Ok(())
        }
    }
}
