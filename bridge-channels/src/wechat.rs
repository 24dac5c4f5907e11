use crate::storage::FileStorage;
use crate::telegram::split_message;
use crate::token_cache::{AccessTokenCache, FetchedToken};
use crate::traits::PlatformAdapter;
use crate::types::{
    MessageType, NormalizedMessage, PlatformType, PlatformUserId, RemoteFile, StoredFile,
    WebhookAuth,
};
use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use quick_xml::Reader as XmlReader;
use quick_xml::events::Event;
use serde::Deserialize;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::time::Duration;

pub const WECHAT_MAX_MESSAGE_CHARS: usize = 2048;
const WECHAT_DEFAULT_API_BASE: &str = "https://api.weixin.qq.com";
const WECHAT_DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
const TOKEN_REFRESH_LEEWAY: Duration = Duration::from_secs(300);
const TOKEN_FALLBACK_EXPIRES_S: u64 = 7200;
/// errcodes meaning the access token is invalid or expired.
const EXPIRED_TOKEN_ERRCODES: [i64; 3] = [40001, 40014, 42001];

/// WeChat Official Account adapter (plaintext callback mode, customer-service send API).
pub struct WechatAdapter {
    http: reqwest::Client,
    app_id: String,
    app_secret: String,
    token: String,
    api_base: String,
    access_token: AccessTokenCache,
}

impl std::fmt::Debug for WechatAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WechatAdapter")
            .field("app_id", &self.app_id)
            .field("app_secret", &"<redacted>")
            .field("token", &"<redacted>")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

impl WechatAdapter {
    pub fn new(app_id: &str, app_secret: &str, token: &str) -> Result<Self> {
        let (app_id, app_secret, token) = (app_id.trim(), app_secret.trim(), token.trim());
        if app_id.is_empty() || app_secret.is_empty() || token.is_empty() {
            bail!("wechat app_id, app_secret and token are all required");
        }
        Ok(Self {
            http: build_http(WECHAT_DEFAULT_TIMEOUT)?,
            app_id: app_id.to_string(),
            app_secret: app_secret.to_string(),
            token: token.to_string(),
            api_base: WECHAT_DEFAULT_API_BASE.to_string(),
            access_token: AccessTokenCache::new(TOKEN_REFRESH_LEEWAY),
        })
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        let api_base = api_base.trim().trim_end_matches('/');
        if !api_base.is_empty() {
            self.api_base = api_base.to_string();
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.http = build_http(timeout)?;
        Ok(self)
    }

    async fn access_token(&self) -> Result<String> {
        self.access_token
            .get_or_refresh(|| self.fetch_access_token())
            .await
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn fetch_access_token(&self) -> Result<FetchedToken> {
        let response = self
            .http
            .get(format!("{}/cgi-bin/token", self.api_base))
            .query(&[
                ("grant_type", "client_credential"),
                ("appid", self.app_id.as_str()),
                ("secret", self.app_secret.as_str()),
            ])
            .send()
            .await
            .context("wechat token request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("wechat token request failed: {status} {body}");
        }
        let body: WechatTokenResponse = response
            .json()
            .await
            .context("wechat token response malformed")?;
        if body.errcode != 0 {
            bail!(
                "wechat token request failed: errcode={} errmsg={}",
                body.errcode,
                body.errmsg.unwrap_or_default()
            );
        }
        let token = body
            .access_token
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .ok_or_else(|| anyhow!("wechat token response missing access_token"))?;
        Ok(FetchedToken {
            token,
            expires_in: Duration::from_secs(body.expires_in.unwrap_or(TOKEN_FALLBACK_EXPIRES_S)),
        })
    }

    async fn post_custom_message(
        &self,
        access_token: &str,
        open_id: &str,
        text: &str,
    ) -> Result<WechatStatus> {
        let payload = serde_json::json!({
            "touser": open_id,
            "msgtype": "text",
            "text": { "content": text },
        });
        let response = self
            .http
            .post(format!("{}/cgi-bin/message/custom/send", self.api_base))
            .query(&[("access_token", access_token)])
            .json(&payload)
            .send()
            .await
            .context("wechat custom send request failed")?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("wechat custom send failed: {status} {body}");
        }
        Ok(response
            .json()
            .await
            .context("wechat custom send response malformed")?)
    }

    async fn send_chunk(&self, open_id: &str, chunk: &str) -> Result<()> {
        let token = self.access_token().await?;
        let status = self.post_custom_message(&token, open_id, chunk).await?;
        if !EXPIRED_TOKEN_ERRCODES.contains(&status.errcode) {
            return status.into_result();
        }

        tracing::warn!(errcode = status.errcode, "wechat access token rejected; refreshing once");
        self.access_token.invalidate(&token).await;
        let token = self.access_token().await?;
        self.post_custom_message(&token, open_id, chunk)
            .await?
            .into_result()
    }

    async fn download(&self, file: &RemoteFile, storage: &FileStorage) -> Result<StoredFile> {
        let response = self
            .http
            .get(&file.file_ref)
            .send()
            .await
            .context("wechat media download failed")?
            .error_for_status()
            .context("wechat media download rejected")?;
        let mime_type = file.mime_type.clone().or_else(|| {
            response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
        });
        let bytes = response
            .bytes()
            .await
            .context("wechat media body read failed")?;
        storage
            .save(&bytes, file.file_name.as_deref(), mime_type.as_deref())
            .await
    }
}

fn build_http(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(timeout).build()?)
}

#[async_trait::async_trait]
impl PlatformAdapter for WechatAdapter {
    fn platform_type(&self) -> PlatformType {
        PlatformType::Wechat
    }

    fn parse_incoming(&self, payload: &[u8]) -> Option<NormalizedMessage> {
        let xml = std::str::from_utf8(payload).ok()?;
        match parse_xml_fields(xml) {
            Ok(fields) => normalize_fields(&fields),
            Err(error) => {
                tracing::debug!(%error, "ignoring unparseable wechat payload");
                None
            }
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(open_id = %platform_user_id))]
    async fn send(&self, platform_user_id: &str, text: &str) -> Result<()> {
        let chunks = split_message(text, WECHAT_MAX_MESSAGE_CHARS);
        if chunks.is_empty() {
            bail!("wechat send rejected: empty message");
        }
        for chunk in &chunks {
            self.send_chunk(platform_user_id, chunk).await?;
        }
        Ok(())
    }

    fn validate_signature(&self, auth: &WebhookAuth) -> bool {
        match (&auth.signature, &auth.timestamp, &auth.nonce) {
            (Some(signature), Some(timestamp), Some(nonce)) => {
                verify_wechat_signature(&self.token, timestamp, nonce, signature)
            }
            _ => false,
        }
    }

    async fn fetch_file(&self, file: &RemoteFile, storage: &FileStorage) -> Option<StoredFile> {
        match self.download(file, storage).await {
            Ok(stored) => Some(stored),
            Err(error) => {
                tracing::warn!(%error, url = %file.file_ref, "wechat attachment fetch failed");
                None
            }
        }
    }
}

/// SHA-1 over the lexicographically sorted `token`, `timestamp`, `nonce`, as lower-case hex.
pub fn compute_wechat_signature(token: &str, timestamp: &str, nonce: &str) -> String {
    let mut parts = [token, timestamp, nonce];
    parts.sort_unstable();
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub fn verify_wechat_signature(token: &str, timestamp: &str, nonce: &str, signature: &str) -> bool {
    let (token, timestamp, nonce, signature) =
        (token.trim(), timestamp.trim(), nonce.trim(), signature.trim());
    if token.is_empty() || timestamp.is_empty() || nonce.is_empty() || signature.is_empty() {
        return false;
    }
    compute_wechat_signature(token, timestamp, nonce).eq_ignore_ascii_case(signature)
}

fn parse_xml_fields(xml: &str) -> Result<HashMap<String, String>> {
    let mut reader = XmlReader::from_str(xml);
    reader.trim_text(true);
    let mut buffer = Vec::new();
    let mut current_tag: Option<String> = None;
    let mut fields = HashMap::new();
    loop {
        match reader.read_event_into(&mut buffer) {
            Ok(Event::Start(event)) => {
                current_tag =
                    Some(String::from_utf8_lossy(event.local_name().as_ref()).to_string());
            }
            Ok(Event::Text(event)) => {
                if let Some(tag) = current_tag.take() {
                    let text = event
                        .unescape()
                        .map_err(|error| anyhow!("wechat xml text decode failed: {error}"))?;
                    insert_field(&mut fields, tag, &text);
                }
            }
            Ok(Event::CData(event)) => {
                if let Some(tag) = current_tag.take() {
                    insert_field(&mut fields, tag, &String::from_utf8_lossy(event.as_ref()));
                }
            }
            Ok(Event::End(_)) => current_tag = None,
            Ok(Event::Eof) => break,
            Err(error) => bail!("wechat xml parse failed: {error}"),
            _ => {}
        }
        buffer.clear();
    }
    Ok(fields)
}

fn insert_field(fields: &mut HashMap<String, String>, tag: String, value: &str) {
    let value = value.trim();
    if !value.is_empty() {
        fields.insert(tag, value.to_string());
    }
}

fn normalize_fields(fields: &HashMap<String, String>) -> Option<NormalizedMessage> {
    let field = |name: &str| fields.get(name).map(String::as_str);
    let open_id = field("FromUserName")?;
    let msg_type = field("MsgType")?.to_ascii_lowercase();

    let (message_type, text, file) = match msg_type.as_str() {
        "text" => (MessageType::Text, field("Content")?.to_string(), None),
        "image" => {
            let file = field("PicUrl").map(|url| RemoteFile {
                file_ref: url.to_string(),
                file_name: None,
                mime_type: Some("image/jpeg".to_string()),
            });
            (MessageType::Photo, "[photo]".to_string(), file)
        }
        "voice" => {
            let text = field("Recognition").unwrap_or("[voice]").to_string();
            (MessageType::Voice, text, None)
        }
        "event" => match field("Event").map(str::to_ascii_lowercase).as_deref() {
            Some("subscribe") => (MessageType::Event, "/start".to_string(), None),
            _ => return None,
        },
        _ => return None,
    };

    let received_at = field("CreateTime")
        .and_then(|raw| raw.parse::<i64>().ok())
        .and_then(|seconds| DateTime::<Utc>::from_timestamp(seconds, 0))
        .unwrap_or_else(Utc::now);

    Some(NormalizedMessage {
        platform_type: PlatformType::Wechat,
        platform_user_id: PlatformUserId::new(open_id),
        platform_username: None,
        text,
        message_type,
        file,
        platform_message_id: field("MsgId").map(ToOwned::to_owned),
        received_at,
    })
}

#[derive(Debug, Deserialize)]
struct WechatTokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    errcode: i64,
    #[serde(default)]
    errmsg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WechatStatus {
    #[serde(default = "missing_errcode")]
    errcode: i64,
    #[serde(default)]
    errmsg: Option<String>,
}

fn missing_errcode() -> i64 {
    -1
}

impl WechatStatus {
    fn into_result(self) -> Result<()> {
        if self.errcode == 0 {
            return Ok(());
        }
        Err(anyhow!(
            "wechat custom send failed: errcode={} errmsg={}",
            self.errcode,
            self.errmsg.unwrap_or_else(|| "unknown".to_string())
        ))
    }
}
