use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::VkConfig;
use crate::files;
use crate::platform::{
    CommandSpec, EventHandler, FileRef, FileSource, InboundEvent, PlatformAdapter, PlatformKind,
    SendButton,
};

const API_BASE: &str = "https://api.vk.com/method";
const API_VERSION: &str = "5.199";

/// What the listen loop should do after one long-poll response.
#[derive(Debug, PartialEq, Eq)]
enum PollOutcome {
    Polled,
    RefreshServer,
}

/// VK community-bot adapter: Bots Long Poll inbound, `messages.send` with
/// one-time keyboards outbound. Buttons are text buttons carrying the token
/// in their payload, so a press arrives as a regular `message_new`.
pub struct VkAdapter {
    client: reqwest::Client,
    token: String,
    group_id: u64,
    commands: Vec<CommandSpec>,
}

impl VkAdapter {
    pub fn new(config: &VkConfig, commands: Vec<CommandSpec>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: config.access_token.clone(),
            group_id: config.group_id,
            commands,
        }
    }

    async fn api(&self, method: &str, params: &[(&str, String)]) -> Result<Value> {
        let url = format!("{API_BASE}/{method}");
        let mut form: Vec<(&str, String)> = params.to_vec();
        form.push(("access_token", self.token.clone()));
        form.push(("v", API_VERSION.to_string()));

        let body: Value = self
            .client
            .post(&url)
            .form(&form)
            .send()
            .await
            .with_context(|| format!("vk {method} request failed"))?
            .json()
            .await
            .with_context(|| format!("vk {method} returned non-JSON"))?;

        if let Some(error) = body.get("error") {
            bail!(
                "vk {method} error: {}",
                error
                    .get("error_msg")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
            );
        }
        body.get("response")
            .cloned()
            .ok_or_else(|| anyhow!("vk {method} response missing 'response'"))
    }

    async fn long_poll_server(&self) -> Result<(String, String, String)> {
        let response = self
            .api(
                "groups.getLongPollServer",
                &[("group_id", self.group_id.to_string())],
            )
            .await?;
        let field = |name: &str| -> Result<String> {
            response
                .get(name)
                .map(json_to_string)
                .ok_or_else(|| anyhow!("long poll server response missing '{name}'"))
        };
        Ok((field("server")?, field("key")?, field("ts")?))
    }

    fn keyboard_json(keyboard: &[SendButton]) -> Option<String> {
        if keyboard.is_empty() {
            return None;
        }
        let buttons: Vec<Value> = keyboard
            .iter()
            .map(|button| {
                let mut action = json!({
                    "type": "text",
                    "label": button.label,
                });
                // The payload field is a JSON document; a bare JSON string
                // naming the token comes back verbatim on the press. The API
                // rejects null, so tokenless buttons omit the field.
                if let Some(token) = &button.token {
                    action["payload"] = Value::String(Value::String(token.clone()).to_string());
                }
                json!([{
                    "action": action,
                    "color": button.intent.as_deref().unwrap_or("secondary"),
                }])
            })
            .collect();
        Some(json!({ "one_time": true, "buttons": buttons }).to_string())
    }

    async fn send_message(
        &self,
        peer_id: &str,
        text: &str,
        attachment: Option<String>,
        keyboard: &[SendButton],
    ) -> Result<()> {
        let mut params = vec![
            ("peer_id", peer_id.to_string()),
            ("message", text.to_string()),
            (
                "random_id",
                (chrono::Utc::now().timestamp_micros() & 0x7FFF_FFFF).to_string(),
            ),
        ];
        if let Some(attachment) = attachment {
            params.push(("attachment", attachment));
        }
        if let Some(keyboard) = Self::keyboard_json(keyboard) {
            params.push(("keyboard", keyboard));
        }
        self.api("messages.send", &params).await?;
        Ok(())
    }

    /// Upload flow: getMessagesUploadServer -> multipart POST ->
    /// saveMessagesPhoto -> attachment id.
    async fn upload_photo(&self, peer_id: &str, file: &FileSource) -> Result<String> {
        let (data, filename) = files::fetch(file).await?;
        let upload_url = self
            .api(
                "photos.getMessagesUploadServer",
                &[("peer_id", peer_id.to_string())],
            )
            .await?
            .get("upload_url")
            .map(json_to_string)
            .ok_or_else(|| anyhow!("missing upload_url"))?;

        let part = reqwest::multipart::Part::bytes(data).file_name(filename);
        let uploaded: Value = self
            .client
            .post(&upload_url)
            .multipart(reqwest::multipart::Form::new().part("photo", part))
            .send()
            .await?
            .json()
            .await
            .context("vk photo upload returned non-JSON")?;

        let saved = self
            .api(
                "photos.saveMessagesPhoto",
                &[
                    ("photo", uploaded.get("photo").map(json_to_string).unwrap_or_default()),
                    ("server", uploaded.get("server").map(json_to_string).unwrap_or_default()),
                    ("hash", uploaded.get("hash").map(json_to_string).unwrap_or_default()),
                ],
            )
            .await?;
        let photo = saved
            .get(0)
            .ok_or_else(|| anyhow!("saveMessagesPhoto returned no photo"))?;
        Ok(format!(
            "photo{}_{}",
            photo.get("owner_id").map(json_to_string).unwrap_or_default(),
            photo.get("id").map(json_to_string).unwrap_or_default()
        ))
    }

    async fn upload_doc(&self, peer_id: &str, file: &FileSource) -> Result<String> {
        let (data, filename) = files::fetch(file).await?;
        let upload_url = self
            .api(
                "docs.getMessagesUploadServer",
                &[("type", "doc".to_string()), ("peer_id", peer_id.to_string())],
            )
            .await?
            .get("upload_url")
            .map(json_to_string)
            .ok_or_else(|| anyhow!("missing upload_url"))?;

        let part = reqwest::multipart::Part::bytes(data).file_name(filename.clone());
        let uploaded: Value = self
            .client
            .post(&upload_url)
            .multipart(reqwest::multipart::Form::new().part("file", part))
            .send()
            .await?
            .json()
            .await
            .context("vk doc upload returned non-JSON")?;

        let saved = self
            .api(
                "docs.save",
                &[
                    ("file", uploaded.get("file").map(json_to_string).unwrap_or_default()),
                    ("title", filename),
                ],
            )
            .await?;
        let doc = saved
            .get("doc")
            .ok_or_else(|| anyhow!("docs.save returned no doc"))?;
        Ok(format!(
            "doc{}_{}",
            doc.get("owner_id").map(json_to_string).unwrap_or_default(),
            doc.get("id").map(json_to_string).unwrap_or_default()
        ))
    }

    /// Apply one long-poll response body: resync the cursor, surface
    /// `message_new` updates to the handler, or ask for a server refresh.
    fn apply_poll_body(&self, body: &Value, ts: &mut String, handler: &EventHandler) -> PollOutcome {
        // failed=1 -> resync ts, failed=2/3 -> the key expired.
        if let Some(failed) = body.get("failed").and_then(Value::as_i64) {
            if failed == 1 {
                if let Some(new_ts) = body.get("ts").map(json_to_string) {
                    *ts = new_ts;
                }
                return PollOutcome::Polled;
            }
            return PollOutcome::RefreshServer;
        }

        if let Some(new_ts) = body.get("ts").map(json_to_string) {
            *ts = new_ts;
        }

        for update in body
            .get("updates")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if update.get("type").and_then(Value::as_str) != Some("message_new") {
                continue;
            }
            let message = update
                .pointer("/object/message")
                .or_else(|| update.get("object"));
            if let Some(event) = message.and_then(|m| self.normalize(m)) {
                handler(event);
            }
        }
        PollOutcome::Polled
    }

    fn normalize(&self, message: &Value) -> Option<InboundEvent> {
        let peer_id = message.get("peer_id").map(json_to_string)?;
        let from_id = message
            .get("from_id")
            .or_else(|| message.get("user_id"))
            .map(json_to_string)
            .unwrap_or_else(|| peer_id.clone());
        let text = message.get("text").and_then(Value::as_str).unwrap_or("");

        let mut event = InboundEvent::new(PlatformKind::Vk, peer_id.clone(), from_id);

        let message_id = message
            .get("conversation_message_id")
            .or_else(|| message.get("id"))
            .map(json_to_string);
        event.event_id = message_id.clone().map(|id| format!("{peer_id}:{id}"));
        event.reply_id = message_id;
        event.text = Some(text.to_string());

        // The payload field round-trips whatever our keyboard put there: a
        // JSON string naming a token.
        event.callback_token = message
            .get("payload")
            .and_then(Value::as_str)
            .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
            .and_then(|value| value.as_str().map(str::to_string));

        let trimmed = text.trim();
        event.command = self
            .commands
            .iter()
            .find(|spec| trimmed == spec.name || trimmed == format!("/{}", spec.command))
            .map(|spec| spec.command.clone());

        if let Some(attachments) = message.get("attachments").and_then(Value::as_array) {
            let now = chrono::Utc::now().timestamp_millis();
            for attachment in attachments {
                match attachment.get("type").and_then(Value::as_str) {
                    Some("photo") => {
                        let sizes = attachment
                            .pointer("/photo/sizes")
                            .and_then(Value::as_array);
                        let largest = sizes.and_then(|sizes| {
                            sizes.iter().max_by_key(|size| {
                                size.get("width").and_then(Value::as_i64).unwrap_or(0)
                            })
                        });
                        if let Some(url) = largest
                            .and_then(|size| size.get("url"))
                            .and_then(Value::as_str)
                        {
                            event.files.push(FileRef {
                                url: url.to_string(),
                                filename: format!("photo_{now}.jpg"),
                                origin: None,
                                ext: Some("jpg".to_string()),
                            });
                        }
                    }
                    Some("doc") => {
                        let doc = attachment.get("doc");
                        let url = doc.and_then(|d| d.get("url")).and_then(Value::as_str);
                        if let Some(url) = url {
                            let origin = doc
                                .and_then(|d| d.get("title"))
                                .and_then(Value::as_str)
                                .map(str::to_string);
                            let ext = doc
                                .and_then(|d| d.get("ext"))
                                .and_then(Value::as_str)
                                .map(str::to_string);
                            event.files.push(FileRef {
                                url: url.to_string(),
                                filename: match &ext {
                                    Some(ext) => format!("file_{now}.{ext}"),
                                    None => format!("file_{now}"),
                                },
                                origin,
                                ext,
                            });
                        }
                    }
                    _ => {}
                }
            }
        }

        Some(event)
    }
}

#[async_trait]
impl PlatformAdapter for VkAdapter {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Vk
    }

    async fn listen(&self, handler: EventHandler) -> Result<()> {
        info!("Starting VK platform (group {})...", self.group_id);

        let (mut server, mut key, mut ts) = self.long_poll_server().await?;

        loop {
            let poll = self
                .client
                .get(&server)
                .query(&[
                    ("act", "a_check"),
                    ("key", &key),
                    ("ts", &ts),
                    ("wait", "25"),
                ])
                .send()
                .await
                .and_then(|r| r.error_for_status());

            let body: Value = match poll {
                Ok(response) => match response.json().await {
                    Ok(body) => body,
                    Err(e) => {
                        warn!("VK long poll returned non-JSON: {:#}", e);
                        tokio::time::sleep(Duration::from_secs(3)).await;
                        continue;
                    }
                },
                Err(e) => {
                    warn!("VK long poll request failed: {:#}", e);
                    tokio::time::sleep(Duration::from_secs(3)).await;
                    continue;
                }
            };

            match self.apply_poll_body(&body, &mut ts, &handler) {
                PollOutcome::Polled => {}
                PollOutcome::RefreshServer => {
                    // Key expiry is routine; a transient failure refreshing
                    // must not take the loop down.
                    match self.long_poll_server().await {
                        Ok((s, k, t)) => {
                            server = s;
                            key = k;
                            ts = t;
                        }
                        Err(e) => {
                            warn!("VK long poll server refresh failed: {:#}", e);
                            tokio::time::sleep(Duration::from_secs(3)).await;
                        }
                    }
                }
            }
        }
    }

    async fn send_text(&self, chat_id: &str, text: &str, keyboard: &[SendButton]) -> Result<()> {
        self.send_message(chat_id, text, None, keyboard).await
    }

    async fn send_photo(
        &self,
        chat_id: &str,
        text: &str,
        file: &FileSource,
        keyboard: &[SendButton],
    ) -> Result<()> {
        let attachment = self.upload_photo(chat_id, file).await?;
        self.send_message(chat_id, text, Some(attachment), keyboard)
            .await
    }

    async fn send_file(
        &self,
        chat_id: &str,
        text: &str,
        file: &FileSource,
        keyboard: &[SendButton],
    ) -> Result<()> {
        let attachment = self.upload_doc(chat_id, file).await?;
        self.send_message(chat_id, text, Some(attachment), keyboard)
            .await
    }

    async fn set_commands(&self, _commands: &[CommandSpec]) -> Result<()> {
        // VK has no global command registry; commands surface through
        // keyboards instead.
        Ok(())
    }
}

/// VK mixes numbers and strings for ids and cursors; normalize to a bare
/// string either way.
fn json_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
