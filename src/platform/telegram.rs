use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{
    BotCommand, ChatId, Document, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, PhotoSize,
};
use tracing::{info, warn};

use crate::config::TelegramConfig;
use crate::platform::{
    CommandSpec, EventHandler, FileRef, FileSource, InboundEvent, PlatformAdapter, PlatformKind,
    SendButton,
};

/// Telegram adapter: long-polling inbound via teloxide's dispatcher, Bot API
/// outbound with inline callback keyboards.
pub struct TelegramAdapter {
    bot: Bot,
    token: String,
    commands: Vec<CommandSpec>,
}

struct TgDeps {
    handler: EventHandler,
    token: String,
    commands: Vec<String>,
}

impl TelegramAdapter {
    pub fn new(config: &TelegramConfig, commands: Vec<CommandSpec>) -> Self {
        Self {
            bot: Bot::new(&config.bot_token),
            token: config.bot_token.clone(),
            commands,
        }
    }

    fn keyboard_markup(keyboard: &[SendButton]) -> Option<InlineKeyboardMarkup> {
        if keyboard.is_empty() {
            return None;
        }
        // One button per row.
        let rows: Vec<Vec<InlineKeyboardButton>> = keyboard
            .iter()
            .map(|button| {
                vec![InlineKeyboardButton::callback(
                    button.label.clone(),
                    callback_data(button),
                )]
            })
            .collect();
        Some(InlineKeyboardMarkup::new(rows))
    }

    fn input_file(file: &FileSource) -> Result<InputFile> {
        Ok(match file {
            FileSource::Url(url) => InputFile::url(reqwest::Url::parse(url).context("bad file URL")?),
            FileSource::Path(path) => InputFile::file(path.clone()),
            FileSource::Bytes { data, filename } => {
                InputFile::memory(data.clone()).file_name(filename.clone())
            }
        })
    }

    fn chat_id(chat_id: &str) -> Result<ChatId> {
        Ok(ChatId(chat_id.parse::<i64>().context("bad telegram chat id")?))
    }
}

#[async_trait]
impl PlatformAdapter for TelegramAdapter {
    fn kind(&self) -> PlatformKind {
        PlatformKind::Telegram
    }

    async fn listen(&self, handler: EventHandler) -> Result<()> {
        info!("Starting Telegram platform...");

        let deps = Arc::new(TgDeps {
            handler,
            token: self.token.clone(),
            commands: self.commands.iter().map(|c| c.command.clone()).collect(),
        });

        let tree = dptree::entry()
            .branch(Update::filter_message().endpoint(on_message))
            .branch(Update::filter_callback_query().endpoint(on_callback));

        Dispatcher::builder(self.bot.clone(), tree)
            .dependencies(dptree::deps![deps])
            .default_handler(|upd| async move {
                warn!("Unhandled telegram update: {:?}", upd.id);
            })
            .error_handler(LoggingErrorHandler::with_custom_text("telegram"))
            .build()
            .dispatch()
            .await;

        Ok(())
    }

    async fn send_text(&self, chat_id: &str, text: &str, keyboard: &[SendButton]) -> Result<()> {
        let chat = Self::chat_id(chat_id)?;
        let mut request = self.bot.send_message(chat, text);
        if let Some(markup) = Self::keyboard_markup(keyboard) {
            request = request.reply_markup(markup);
        }
        request.await?;
        Ok(())
    }

    async fn send_photo(
        &self,
        chat_id: &str,
        text: &str,
        file: &FileSource,
        keyboard: &[SendButton],
    ) -> Result<()> {
        let chat = Self::chat_id(chat_id)?;
        let mut request = self.bot.send_photo(chat, Self::input_file(file)?).caption(text);
        if let Some(markup) = Self::keyboard_markup(keyboard) {
            request = request.reply_markup(markup);
        }
        request.await?;
        Ok(())
    }

    async fn send_file(
        &self,
        chat_id: &str,
        text: &str,
        file: &FileSource,
        keyboard: &[SendButton],
    ) -> Result<()> {
        let chat = Self::chat_id(chat_id)?;
        let mut request = self
            .bot
            .send_document(chat, Self::input_file(file)?)
            .caption(text);
        if let Some(markup) = Self::keyboard_markup(keyboard) {
            request = request.reply_markup(markup);
        }
        request.await?;
        Ok(())
    }

    async fn set_commands(&self, commands: &[CommandSpec]) -> Result<()> {
        // Telegram only accepts lowercase latin command names; skip the rest
        // (VK-style display commands) instead of failing the whole call.
        let registrable: Vec<BotCommand> = commands
            .iter()
            .filter(|spec| {
                let ok = spec
                    .command
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
                if !ok {
                    warn!("Skipping non-registrable telegram command '{}'", spec.command);
                }
                ok
            })
            .map(|spec| BotCommand::new(spec.command.clone(), spec.description.clone()))
            .collect();

        if registrable.is_empty() {
            return Ok(());
        }
        self.bot.set_my_commands(registrable).await?;
        Ok(())
    }
}

/// Match a leading `/command` (with optional `@botname` suffix) against the
/// registered set; the remainder of the text is the callback-token candidate.
fn match_command<'a>(text: &'a str, commands: &[String]) -> (Option<String>, Option<&'a str>) {
    let Some(stripped) = text.strip_prefix('/') else {
        return (None, None);
    };
    let mut parts = stripped.splitn(2, char::is_whitespace);
    let word = parts.next().unwrap_or_default();
    let name = word.split('@').next().unwrap_or(word);

    if commands.iter().any(|c| c == name) {
        let args = parts.next().map(str::trim).filter(|a| !a.is_empty());
        (Some(name.to_string()), args)
    } else {
        (None, None)
    }
}

async fn resolve_file(
    bot: &Bot,
    token: &str,
    meta: &teloxide::types::FileMeta,
) -> Result<(String, String)> {
    let file = bot.get_file(meta.id.clone()).await?;
    let url = format!("https://api.telegram.org/file/bot{}/{}", token, file.path);
    Ok((url, file.path))
}

/// Callback data is the minted token, or the label for payload-less buttons.
/// Telegram caps callback data at 64 bytes, so long labels are clipped on a
/// character boundary rather than failing the whole send.
fn callback_data(button: &SendButton) -> String {
    match &button.token {
        Some(token) => token.clone(),
        None => {
            let mut label = button.label.clone();
            while label.len() > 64 {
                label.pop();
            }
            label
        }
    }
}

fn ext_of(name: &str) -> Option<String> {
    name.rsplit_once('.').map(|(_, ext)| ext.to_string())
}

async fn collect_files(
    bot: &Bot,
    token: &str,
    photo: Option<&[PhotoSize]>,
    document: Option<&Document>,
) -> Vec<FileRef> {
    let mut files = Vec::new();
    let now = chrono::Utc::now().timestamp_millis();

    // Telegram lists the same photo in several sizes; only the largest one
    // matters.
    if let Some(largest) = photo.and_then(|sizes| sizes.last()) {
        match resolve_file(bot, token, &largest.file).await {
            Ok((url, path)) => files.push(FileRef {
                url,
                filename: format!("photo_{now}.jpg"),
                origin: Some(path.clone()),
                ext: ext_of(&path),
            }),
            Err(e) => warn!("Failed to resolve telegram photo: {:#}", e),
        }
    }

    if let Some(doc) = document {
        match resolve_file(bot, token, &doc.file).await {
            Ok((url, path)) => {
                let origin = doc.file_name.clone();
                let ext = origin
                    .as_deref()
                    .and_then(ext_of)
                    .or_else(|| ext_of(&path));
                files.push(FileRef {
                    url,
                    filename: match &ext {
                        Some(ext) => format!("file_{now}.{ext}"),
                        None => format!("file_{now}"),
                    },
                    origin,
                    ext,
                });
            }
            Err(e) => warn!("Failed to resolve telegram document: {:#}", e),
        }
    }

    files
}

async fn on_message(bot: Bot, msg: Message, deps: Arc<TgDeps>) -> ResponseResult<()> {
    let chat_id = msg.chat.id.to_string();
    let user_id = msg
        .from
        .as_ref()
        .map(|user| user.id.to_string())
        .unwrap_or_else(|| chat_id.clone());

    let text = msg.text().or_else(|| msg.caption()).map(str::to_string);
    let (command, args) = match text.as_deref() {
        Some(text) => match_command(text, &deps.commands),
        None => (None, None),
    };

    let files = collect_files(&bot, &deps.token, msg.photo(), msg.document()).await;

    let mut event = InboundEvent::new(PlatformKind::Telegram, chat_id.clone(), user_id);
    // Message ids are only unique per chat, so qualify with the chat id.
    event.event_id = Some(format!("{}:{}", chat_id, msg.id.0));
    event.reply_id = Some(msg.id.0.to_string());
    event.callback_token = args.map(str::to_string);
    event.command = command;
    event.text = text;
    event.files = files;

    (deps.handler)(event);
    Ok(())
}

async fn on_callback(bot: Bot, q: CallbackQuery, deps: Arc<TgDeps>) -> ResponseResult<()> {
    let chat_id = q
        .message
        .as_ref()
        .map(|m| m.chat().id.to_string())
        .unwrap_or_else(|| q.from.id.to_string());
    let user_id = q.from.id.to_string();

    let mut event = InboundEvent::new(PlatformKind::Telegram, chat_id.clone(), user_id);
    event.event_id = Some(format!("cb:{}", q.id.0));
    event.callback_token = q.data.clone();
    event.reply_id = q.message.as_ref().map(|m| m.id().0.to_string());

    (deps.handler)(event);

    // UI hygiene: acknowledge the press and drop the keyboard message.
    // Neither may block processing or propagate failure.
    bot.answer_callback_query(q.id.clone()).await.ok();
    if let Some(message) = &q.message {
        bot.delete_message(message.chat().id, message.id()).await.ok();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commands() -> Vec<String> {
        vec!["start".to_string(), "help".to_string()]
    }

    #[test]
    fn test_match_plain_command() {
        assert_eq!(
            match_command("/start", &commands()),
            (Some("start".to_string()), None)
        );
    }

    #[test]
    fn test_match_command_with_bot_suffix_and_args() {
        assert_eq!(
            match_command("/start@my_bot abc-token", &commands()),
            (Some("start".to_string()), Some("abc-token"))
        );
    }

    #[test]
    fn test_unknown_command_does_not_match() {
        assert_eq!(match_command("/frobnicate", &commands()), (None, None));
    }

    #[test]
    fn test_plain_text_is_not_a_command() {
        assert_eq!(match_command("start", &commands()), (None, None));
    }

    #[test]
    fn test_callback_data_fits_telegram_limit() {
        let long_label = SendButton {
            label: "x".repeat(100),
            intent: None,
            token: None,
        };
        assert_eq!(callback_data(&long_label).len(), 64);

        let multibyte = SendButton {
            label: "ß".repeat(50),
            intent: None,
            token: None,
        };
        let data = callback_data(&multibyte);
        assert!(data.len() <= 64);
        assert!(data.chars().all(|c| c == 'ß'));

        let tokened = SendButton {
            label: "x".repeat(100),
            intent: None,
            token: Some("tok-1".to_string()),
        };
        assert_eq!(callback_data(&tokened), "tok-1");
    }

    #[test]
    fn test_ext_of() {
        assert_eq!(ext_of("report.final.pdf").as_deref(), Some("pdf"));
        assert_eq!(ext_of("noext"), None);
    }
}
