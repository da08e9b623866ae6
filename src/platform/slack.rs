use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use axum::extract::{Form, Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::SlackConfig;
use crate::files;
use crate::platform::{
    CommandSpec, EventHandler, FileRef, FileSource, InboundEvent, PlatformAdapter, PlatformKind,
    SendButton,
};

const API_BASE: &str = "https://slack.com/api";

/// Slack adapter: Events API webhook inbound (plus an interactivity endpoint
/// for button presses), Web API outbound with `actions` blocks.
pub struct SlackAdapter {
    client: reqwest::Client,
    bot_token: String,
    port: u16,
    commands: Vec<CommandSpec>,
}

struct SlackState {
    handler: EventHandler,
    commands: Vec<CommandSpec>,
    client: reqwest::Client,
    bot_token: String,
}

#[derive(Deserialize)]
struct InteractiveForm {
    payload: String,
}

impl SlackAdapter {
    pub fn new(config: &SlackConfig, commands: Vec<CommandSpec>) -> Self {
        Self {
            client: reqwest::Client::new(),
            bot_token: config.bot_token.clone(),
            port: config.port,
            commands,
        }
    }

    async fn api(&self, method: &str, body: Value) -> Result<Value> {
        api_call(&self.client, &self.bot_token, method, body).await
    }

    fn blocks(keyboard: &[SendButton]) -> Option<Value> {
        if keyboard.is_empty() {
            return None;
        }
        let elements: Vec<Value> = keyboard
            .iter()
            .enumerate()
            .map(|(index, button)| {
                json!({
                    "type": "button",
                    "action_id": format!("step_option_{index}"),
                    "text": { "type": "plain_text", "emoji": true, "text": button.label },
                    "value": button.token.clone().unwrap_or_else(|| button.label.clone()),
                })
            })
            .collect();
        Some(json!([{ "type": "actions", "elements": elements }]))
    }

    async fn post_message(
        &self,
        channel: &str,
        text: &str,
        keyboard: &[SendButton],
    ) -> Result<()> {
        let mut body = json!({ "channel": channel, "text": text });
        if let Some(blocks) = Self::blocks(keyboard) {
            body["blocks"] = blocks;
        }
        self.api("chat.postMessage", body).await?;
        Ok(())
    }

    /// Three-step external upload: reserve an upload URL, push the bytes,
    /// then complete against the channel.
    async fn upload(&self, channel: &str, comment: Option<&str>, file: &FileSource) -> Result<()> {
        let (data, filename) = files::fetch(file).await?;

        let reservation = self
            .api(
                "files.getUploadURLExternal",
                json!({ "filename": filename, "length": data.len() }),
            )
            .await?;
        let upload_url = reservation
            .get("upload_url")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("missing upload_url"))?
            .to_string();
        let file_id = reservation
            .get("file_id")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("missing file_id"))?
            .to_string();

        let part = reqwest::multipart::Part::bytes(data).file_name(filename.clone());
        self.client
            .post(&upload_url)
            .multipart(reqwest::multipart::Form::new().part("file", part))
            .send()
            .await
            .context("slack file upload failed")?
            .error_for_status()
            .context("slack file upload rejected")?;

        self.api(
            "files.completeUploadExternal",
            complete_upload_body(&file_id, &filename, channel, comment),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl PlatformAdapter for SlackAdapter {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Slack
    }

    async fn listen(&self, handler: EventHandler) -> Result<()> {
        info!("Starting Slack platform on port {}...", self.port);

        let state = Arc::new(SlackState {
            handler,
            commands: self.commands.clone(),
            client: self.client.clone(),
            bot_token: self.bot_token.clone(),
        });

        let router = Router::new()
            .route("/slack/events", post(on_event))
            .route("/slack/interactive", post(on_interactive))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("Failed to bind slack webhook port {}", self.port))?;
        axum::serve(listener, router)
            .await
            .context("slack webhook server failed")?;
        Ok(())
    }

    async fn send_text(&self, chat_id: &str, text: &str, keyboard: &[SendButton]) -> Result<()> {
        self.post_message(chat_id, text, keyboard).await
    }

    async fn send_photo(
        &self,
        chat_id: &str,
        text: &str,
        file: &FileSource,
        keyboard: &[SendButton],
    ) -> Result<()> {
        // With a keyboard, the follow-up message carries the text; repeating
        // it as the upload comment would deliver it twice.
        if keyboard.is_empty() {
            self.upload(chat_id, Some(text), file).await
        } else {
            self.upload(chat_id, None, file).await?;
            self.post_message(chat_id, text, keyboard).await
        }
    }

    async fn send_file(
        &self,
        chat_id: &str,
        text: &str,
        file: &FileSource,
        keyboard: &[SendButton],
    ) -> Result<()> {
        self.send_photo(chat_id, text, file, keyboard).await
    }

    async fn set_commands(&self, _commands: &[CommandSpec]) -> Result<()> {
        // Slack has no bot-scoped command registry to push to; the `#name`
        // message convention stands in for one.
        Ok(())
    }
}

async fn api_call(
    client: &reqwest::Client,
    bot_token: &str,
    method: &str,
    body: Value,
) -> Result<Value> {
    let response: Value = client
        .post(format!("{API_BASE}/{method}"))
        .bearer_auth(bot_token)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("slack {method} request failed"))?
        .json()
        .await
        .with_context(|| format!("slack {method} returned non-JSON"))?;

    if response.get("ok").and_then(Value::as_bool) != Some(true) {
        bail!(
            "slack {method} error: {}",
            response
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
        );
    }
    Ok(response)
}

fn complete_upload_body(
    file_id: &str,
    filename: &str,
    channel: &str,
    comment: Option<&str>,
) -> Value {
    let mut body = json!({
        "files": [{ "id": file_id, "title": filename }],
        "channel_id": channel,
    });
    if let Some(comment) = comment.filter(|c| !c.is_empty()) {
        body["initial_comment"] = json!(comment);
    }
    body
}

/// Match the `#name` message convention; the remainder is the callback-token
/// candidate.
fn match_command<'a>(
    text: &'a str,
    commands: &[CommandSpec],
) -> (Option<String>, Option<&'a str>) {
    let trimmed = text.trim();
    for spec in commands {
        let prefix = format!("#{}", spec.command);
        if let Some(rest) = trimmed.strip_prefix(&prefix) {
            if rest.is_empty() || rest.starts_with(char::is_whitespace) {
                let args = rest.trim();
                return (
                    Some(spec.command.clone()),
                    (!args.is_empty()).then_some(args),
                );
            }
        }
    }
    (None, None)
}

fn normalize_message(body: &Value, commands: &[CommandSpec]) -> Option<InboundEvent> {
    let event = body.get("event")?;
    if event.get("type").and_then(Value::as_str) != Some("message") {
        return None;
    }
    // Ignore our own and other bots' messages, and message edits/deletes.
    // File uploads arrive as subtype `file_share` and must pass through.
    if event.get("bot_id").is_some() {
        return None;
    }
    match event.get("subtype").and_then(Value::as_str) {
        None | Some("file_share") => {}
        Some(_) => return None,
    }

    let channel = event.get("channel").and_then(Value::as_str)?;
    let user = event.get("user").and_then(Value::as_str)?;
    let text = event.get("text").and_then(Value::as_str).unwrap_or("");

    let mut inbound = InboundEvent::new(PlatformKind::Slack, channel, user);
    inbound.event_id = body
        .get("event_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            event
                .get("client_msg_id")
                .and_then(Value::as_str)
                .map(str::to_string)
        });
    inbound.reply_id = event
        .get("ts")
        .and_then(Value::as_str)
        .map(str::to_string);
    inbound.text = Some(text.to_string());

    let (command, args) = match_command(text, commands);
    inbound.command = command;
    inbound.callback_token = args.map(str::to_string);

    if let Some(slack_files) = event.get("files").and_then(Value::as_array) {
        let now = chrono::Utc::now().timestamp_millis();
        for file in slack_files {
            let Some(url) = file
                .get("url_private_download")
                .or_else(|| file.get("url_private"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            let origin = file.get("name").and_then(Value::as_str).map(str::to_string);
            let ext = file
                .get("filetype")
                .and_then(Value::as_str)
                .map(str::to_string);
            inbound.files.push(FileRef {
                url: url.to_string(),
                filename: match (&origin, &ext) {
                    (Some(origin), _) => origin.clone(),
                    (None, Some(ext)) => format!("file_{now}.{ext}"),
                    (None, None) => format!("file_{now}"),
                },
                origin,
                ext,
            });
        }
    }

    Some(inbound)
}

async fn on_event(State(state): State<Arc<SlackState>>, Json(body): Json<Value>) -> Response {
    match body.get("type").and_then(Value::as_str) {
        Some("url_verification") => {
            let challenge = body
                .get("challenge")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Json(json!({ "challenge": challenge })).into_response()
        }
        Some("event_callback") => {
            if let Some(event) = normalize_message(&body, &state.commands) {
                (state.handler)(event);
            }
            StatusCode::OK.into_response()
        }
        other => {
            warn!("Unhandled slack envelope type: {:?}", other);
            StatusCode::OK.into_response()
        }
    }
}

async fn on_interactive(
    State(state): State<Arc<SlackState>>,
    Form(form): Form<InteractiveForm>,
) -> StatusCode {
    let payload: Value = match serde_json::from_str(&form.payload) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Undecodable slack interactive payload: {:#}", e);
            return StatusCode::OK;
        }
    };

    if payload.get("type").and_then(Value::as_str) != Some("block_actions") {
        return StatusCode::OK;
    }

    let Some(action) = payload.pointer("/actions/0") else {
        return StatusCode::OK;
    };
    let channel = payload
        .pointer("/channel/id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let user = payload
        .pointer("/user/id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let mut event = InboundEvent::new(PlatformKind::Slack, channel.clone(), user);
    event.event_id = action
        .get("action_ts")
        .and_then(Value::as_str)
        .map(|ts| format!("act:{ts}"));
    event.callback_token = action
        .get("value")
        .and_then(Value::as_str)
        .map(str::to_string);
    event.text = action
        .pointer("/text/text")
        .and_then(Value::as_str)
        .map(str::to_string);
    event.reply_id = Some(channel.clone());

    (state.handler)(event);

    // UI hygiene: drop the keyboard message after a press; failures are
    // logged and never propagate.
    if let Some(ts) = payload.pointer("/message/ts").and_then(Value::as_str) {
        let client = state.client.clone();
        let token = state.bot_token.clone();
        let ts = ts.to_string();
        tokio::spawn(async move {
            if let Err(e) = api_call(
                &client,
                &token,
                "chat.delete",
                json!({ "channel": channel, "ts": ts }),
            )
            .await
            {
                warn!("Failed to delete slack message: {:#}", e);
            }
        });
    }

    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commands() -> Vec<CommandSpec> {
        vec![CommandSpec {
            name: "/start".to_string(),
            command: "start".to_string(),
            description: "Registration".to_string(),
        }]
    }

    #[test]
    fn test_match_hash_command() {
        assert_eq!(
            match_command("#start", &commands()),
            (Some("start".to_string()), None)
        );
        assert_eq!(
            match_command("#start tok-9", &commands()),
            (Some("start".to_string()), Some("tok-9"))
        );
        assert_eq!(match_command("#startle", &commands()), (None, None));
    }

    #[test]
    fn test_normalize_message_event() {
        let body = json!({
            "type": "event_callback",
            "event_id": "Ev123",
            "event": {
                "type": "message",
                "channel": "C42",
                "user": "U7",
                "text": "hello",
                "ts": "1700000000.000100",
            },
        });

        let event = normalize_message(&body, &commands()).unwrap();
        assert_eq!(event.platform, PlatformKind::Slack);
        assert_eq!(event.chat_id, "C42");
        assert_eq!(event.user_id, "U7");
        assert_eq!(event.event_id.as_deref(), Some("Ev123"));
        assert_eq!(event.text.as_deref(), Some("hello"));
    }

    #[test]
    fn test_normalize_skips_bot_messages() {
        let body = json!({
            "type": "event_callback",
            "event": {
                "type": "message",
                "channel": "C42",
                "bot_id": "B1",
                "text": "from a bot",
            },
        });
        assert!(normalize_message(&body, &commands()).is_none());
    }

    #[test]
    fn test_normalize_keeps_file_share_messages() {
        let body = json!({
            "type": "event_callback",
            "event_id": "Ev125",
            "event": {
                "type": "message",
                "subtype": "file_share",
                "channel": "C42",
                "user": "U7",
                "text": "see attached",
                "files": [{
                    "name": "notes.txt",
                    "filetype": "txt",
                    "url_private_download": "https://files.slack.example/notes.txt",
                }],
            },
        });

        let event = normalize_message(&body, &commands()).unwrap();
        assert_eq!(event.text.as_deref(), Some("see attached"));
        assert_eq!(event.files.len(), 1);
        assert_eq!(event.files[0].filename, "notes.txt");
    }

    #[test]
    fn test_normalize_still_skips_edits() {
        let body = json!({
            "type": "event_callback",
            "event": {
                "type": "message",
                "subtype": "message_changed",
                "channel": "C42",
                "user": "U7",
                "text": "edited",
            },
        });
        assert!(normalize_message(&body, &commands()).is_none());
    }

    #[test]
    fn test_normalize_collects_files() {
        let body = json!({
            "type": "event_callback",
            "event_id": "Ev124",
            "event": {
                "type": "message",
                "channel": "C42",
                "user": "U7",
                "text": "",
                "files": [{
                    "name": "report.pdf",
                    "filetype": "pdf",
                    "url_private_download": "https://files.slack.example/report.pdf",
                }],
            },
        });

        let event = normalize_message(&body, &commands()).unwrap();
        assert_eq!(event.files.len(), 1);
        assert_eq!(event.files[0].filename, "report.pdf");
        assert_eq!(event.files[0].ext.as_deref(), Some("pdf"));
    }

    #[test]
    fn test_upload_comment_is_optional() {
        let with = complete_upload_body("F1", "a.png", "C42", Some("caption"));
        assert_eq!(with["initial_comment"], json!("caption"));
        assert_eq!(with["channel_id"], json!("C42"));

        // No comment when a follow-up message will carry the text.
        let without = complete_upload_body("F1", "a.png", "C42", None);
        assert!(without.get("initial_comment").is_none());
    }

    #[test]
    fn test_blocks_layout() {
        let keyboard = vec![SendButton {
            label: "Mentor".to_string(),
            intent: None,
            token: Some("tok-1".to_string()),
        }];
        let blocks = SlackAdapter::blocks(&keyboard).unwrap();
        assert_eq!(blocks[0]["type"], json!("actions"));
        assert_eq!(blocks[0]["elements"][0]["value"], json!("tok-1"));
        assert_eq!(
            blocks[0]["elements"][0]["text"]["text"],
            json!("Mentor")
        );
    }
}
