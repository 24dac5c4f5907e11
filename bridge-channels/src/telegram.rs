use crate::secret::constant_time_eq;
use crate::storage::FileStorage;
use crate::traits::PlatformAdapter;
use crate::types::{
    MessageType, NormalizedMessage, PlatformType, PlatformUserId, RemoteFile, StoredFile,
    WebhookAuth,
};
use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

pub const TELEGRAM_MAX_MESSAGE_CHARS: usize = 4096;
const TELEGRAM_DEFAULT_API_BASE: &str = "https://api.telegram.org";
const TELEGRAM_DEFAULT_PARSE_MODE: &str = "Markdown";
const TELEGRAM_DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Clone)]
pub struct TelegramAdapter {
    http: reqwest::Client,
    bot_token: String,
    api_base: String,
    webhook_secret: Option<String>,
    parse_mode: Option<String>,
}

impl TelegramAdapter {
    pub fn new(bot_token: &str) -> Result<Self> {
        let bot_token = bot_token.trim();
        if bot_token.is_empty() {
            bail!("telegram bot token is empty");
        }
        Ok(Self {
            http: build_http(TELEGRAM_DEFAULT_TIMEOUT)?,
            bot_token: bot_token.to_string(),
            api_base: TELEGRAM_DEFAULT_API_BASE.to_string(),
            webhook_secret: None,
            parse_mode: Some(TELEGRAM_DEFAULT_PARSE_MODE.to_string()),
        })
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        let api_base = api_base.trim().trim_end_matches('/');
        if !api_base.is_empty() {
            self.api_base = api_base.to_string();
        }
        self
    }

    pub fn with_webhook_secret(mut self, secret: Option<&str>) -> Self {
        self.webhook_secret = secret
            .map(str::trim)
            .filter(|secret| !secret.is_empty())
            .map(ToOwned::to_owned);
        self
    }

    /// `None` (or an empty mode) sends plain text only.
    pub fn with_parse_mode(mut self, parse_mode: Option<&str>) -> Self {
        self.parse_mode = parse_mode
            .map(str::trim)
            .filter(|mode| !mode.is_empty())
            .map(ToOwned::to_owned);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.http = build_http(timeout)?;
        Ok(self)
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "{}/file/bot{}/{}",
            self.api_base,
            self.bot_token,
            file_path.trim_start_matches('/')
        )
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: &serde_json::Value) -> Result<T> {
        let response = self
            .http
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .with_context(|| format!("telegram {method} request failed"))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .unwrap_or_else(|error| format!("<failed to read telegram body: {error}>"));
        let parsed: TelegramApiResponse<T> = serde_json::from_str(&text)
            .map_err(|error| {
                anyhow!("telegram {method} failed: status={status} body={text} ({error})")
            })?;
        if !status.is_success() || !parsed.ok {
            let description = parsed.description.unwrap_or(text);
            bail!("telegram {method} failed: status={status} description={description}");
        }
        parsed
            .result
            .ok_or_else(|| anyhow!("telegram {method} returned no result"))
    }

    /// Resolves the bot's `@username` (without the `@`).
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn get_me(&self) -> Result<Option<String>> {
        let me: TelegramUser = self.call("getMe", &serde_json::json!({})).await?;
        Ok(me.username.filter(|name| !name.is_empty()))
    }

    #[tracing::instrument(level = "info", skip_all, fields(url = %url))]
    pub async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<()> {
        let mut body = serde_json::json!({
            "url": url,
            "allowed_updates": ["message"],
        });
        if let Some(secret) = secret.map(str::trim).filter(|secret| !secret.is_empty()) {
            body["secret_token"] = serde_json::Value::String(secret.to_string());
        }
        let _: bool = self.call("setWebhook", &body).await?;
        Ok(())
    }

    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        parse_mode: Option<&str>,
    ) -> Result<()> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        if let Some(mode) = parse_mode {
            body["parse_mode"] = serde_json::Value::String(mode.to_string());
        }
        let _: serde_json::Value = self.call("sendMessage", &body).await?;
        Ok(())
    }

    async fn send_chunk(&self, chat_id: &str, chunk: &str) -> Result<()> {
        if let Some(mode) = self.parse_mode.as_deref() {
            match self.send_message(chat_id, chunk, Some(mode)).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    tracing::debug!(
                        %error,
                        parse_mode = mode,
                        "formatted telegram send rejected; retrying as plain text"
                    );
                }
            }
        }
        self.send_message(chat_id, chunk, None).await
    }

    async fn download(&self, file: &RemoteFile, storage: &FileStorage) -> Result<StoredFile> {
        let info: TelegramFile = self
            .call("getFile", &serde_json::json!({ "file_id": file.file_ref }))
            .await?;
        let file_path = info
            .file_path
            .filter(|path| !path.is_empty())
            .ok_or_else(|| anyhow!("telegram getFile returned no file_path"))?;
        let bytes = self
            .http
            .get(self.file_url(&file_path))
            .send()
            .await
            .context("telegram file download failed")?
            .error_for_status()
            .context("telegram file download rejected")?
            .bytes()
            .await
            .context("telegram file body read failed")?;
        let file_name = file
            .file_name
            .clone()
            .or_else(|| file_path.rsplit('/').next().map(ToOwned::to_owned));
        storage
            .save(&bytes, file_name.as_deref(), file.mime_type.as_deref())
            .await
    }
}

fn build_http(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

#[async_trait::async_trait]
impl PlatformAdapter for TelegramAdapter {
    fn platform_type(&self) -> PlatformType {
        PlatformType::Telegram
    }

    fn parse_incoming(&self, payload: &[u8]) -> Option<NormalizedMessage> {
        parse_update(payload)
    }

    #[tracing::instrument(level = "info", skip_all, fields(chat_id = %platform_user_id))]
    async fn send(&self, platform_user_id: &str, text: &str) -> Result<()> {
        let chunks = split_message(text, TELEGRAM_MAX_MESSAGE_CHARS);
        if chunks.is_empty() {
            bail!("telegram send rejected: empty message");
        }
        for chunk in &chunks {
            self.send_chunk(platform_user_id, chunk).await?;
        }
        Ok(())
    }

    fn validate_signature(&self, auth: &WebhookAuth) -> bool {
        let Some(expected) = self.webhook_secret.as_deref() else {
            return true;
        };
        auth.secret_header
            .as_deref()
            .is_some_and(|provided| constant_time_eq(provided.trim(), expected))
    }

    async fn fetch_file(&self, file: &RemoteFile, storage: &FileStorage) -> Option<StoredFile> {
        match self.download(file, storage).await {
            Ok(stored) => Some(stored),
            Err(error) => {
                tracing::warn!(
                    %error,
                    file_id = %file.file_ref,
                    "telegram attachment fetch failed"
                );
                None
            }
        }
    }
}

/// Splits `text` into chunks of at most `max_chars` characters.
///
/// A chunk ends at the last newline inside the window when one exists in its second half, otherwise
/// at the character limit. Concatenating the chunks always reproduces `text`.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let window_end = rest
            .char_indices()
            .nth(max_chars)
            .map(|(index, _)| index)
            .unwrap_or(rest.len());
        if window_end == rest.len() {
            chunks.push(rest.to_string());
            break;
        }
        let window = &rest[..window_end];
        let cut = match window.rfind('\n') {
            Some(newline) if newline + 1 >= window_end / 2 => newline + 1,
            _ => window_end,
        };
        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }
    chunks
}

fn parse_update(payload: &[u8]) -> Option<NormalizedMessage> {
    let update: TelegramUpdate = match serde_json::from_slice(payload) {
        Ok(update) => update,
        Err(error) => {
            tracing::debug!(%error, "ignoring unparseable telegram update");
            return None;
        }
    };
    let message = update.message?;
    let (message_type, file) = classify_payload(&message);
    let text = extract_text(&message, message_type)?;

    let platform_user_id = message
        .from
        .as_ref()
        .map(|user| user.id)
        .unwrap_or(message.chat.id)
        .to_string();
    let platform_username = message.from.as_ref().and_then(TelegramUser::display_name);
    let received_at = message
        .date
        .and_then(|seconds| DateTime::<Utc>::from_timestamp(seconds, 0))
        .unwrap_or_else(Utc::now);

    Some(NormalizedMessage {
        platform_type: PlatformType::Telegram,
        platform_user_id: PlatformUserId::new(platform_user_id),
        platform_username,
        text,
        message_type,
        file,
        platform_message_id: message.message_id.map(|id| id.to_string()),
        received_at,
    })
}

fn classify_payload(message: &TelegramMessage) -> (MessageType, Option<RemoteFile>) {
    if let Some(largest) = message
        .photo
        .iter()
        .max_by_key(|size| (size.file_size.unwrap_or(0), size.width.unwrap_or(0)))
    {
        let file = RemoteFile {
            file_ref: largest.file_id.clone(),
            file_name: None,
            mime_type: Some("image/jpeg".to_string()),
        };
        return (MessageType::Photo, Some(file));
    }
    let attachments = [
        (MessageType::Document, &message.document),
        (MessageType::Voice, &message.voice),
        (MessageType::Audio, &message.audio),
        (MessageType::Video, &message.video),
    ];
    for (kind, attachment) in attachments {
        if let Some(attachment) = attachment {
            return (kind, Some(attachment.to_remote()));
        }
    }
    if message.sticker.is_some() {
        return (MessageType::Sticker, None);
    }
    if message.location.is_some() {
        return (MessageType::Location, None);
    }
    (MessageType::Text, None)
}

fn extract_text(message: &TelegramMessage, message_type: MessageType) -> Option<String> {
    let written = message
        .text
        .as_deref()
        .or(message.caption.as_deref())
        .map(str::trim)
        .filter(|text| !text.is_empty());
    match (written, message_type) {
        (Some(text), _) => Some(text.to_string()),
        (None, MessageType::Text) => None,
        (None, kind) => Some(format!("[{kind}]")),
    }
}

#[derive(Debug, Deserialize)]
struct TelegramApiResponse<T> {
    #[serde(default)]
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    #[serde(default)]
    message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    from: Option<TelegramUser>,
    chat: TelegramChat,
    #[serde(default)]
    date: Option<i64>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    photo: Vec<TelegramPhotoSize>,
    #[serde(default)]
    document: Option<TelegramAttachment>,
    #[serde(default)]
    voice: Option<TelegramAttachment>,
    #[serde(default)]
    audio: Option<TelegramAttachment>,
    #[serde(default)]
    video: Option<TelegramAttachment>,
    #[serde(default)]
    sticker: Option<serde_json::Value>,
    #[serde(default)]
    location: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
}

impl TelegramUser {
    fn display_name(&self) -> Option<String> {
        if let Some(username) = self.username.as_deref().filter(|name| !name.is_empty()) {
            return Some(username.to_string());
        }
        let full = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        (!full.is_empty()).then_some(full)
    }
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TelegramPhotoSize {
    file_id: String,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    file_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TelegramAttachment {
    file_id: String,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
}

impl TelegramAttachment {
    fn to_remote(&self) -> RemoteFile {
        RemoteFile {
            file_ref: self.file_id.clone(),
            file_name: self.file_name.clone(),
            mime_type: self.mime_type.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TelegramFile {
    #[serde(default)]
    file_path: Option<String>,
}
