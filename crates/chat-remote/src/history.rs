use std::future::Future;

use chat_core::{
    LoadError, Message, MessageId, Session, UserId,
    normalization::{parse_rfc3339_ms, server_id_from_value},
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{RemoteConfig, service_error_message};

const MESSAGES_PATH: &str = "api/messages";
const MAX_PAGES: u32 = 1_000;

/// Request/response source of the room's prior messages.
pub trait HistorySource: Send + Sync + 'static {
    /// Fetch the whole room history in server order. Never retries.
    fn load(
        &self,
        session: &Session,
    ) -> impl Future<Output = Result<Vec<Message>, LoadError>> + Send;
}

/// Reads the message collection from the service's REST API.
#[derive(Debug, Clone)]
pub struct HttpHistoryLoader {
    http: reqwest::Client,
    config: RemoteConfig,
    page_size: u16,
}

impl HttpHistoryLoader {
    pub fn new(http: reqwest::Client, config: RemoteConfig, page_size: u16) -> Self {
        Self {
            http,
            config,
            page_size: page_size.clamp(1, 100),
        }
    }

    fn request_url(&self, page: u32) -> Result<url::Url, LoadError> {
        let mut url = self
            .config
            .endpoint(MESSAGES_PATH)
            .map_err(|err| LoadError::unreachable(err.message))?;
        url.query_pairs_mut()
            .append_pair("populate", "sender")
            .append_pair("sort", "createdAt:asc")
            .append_pair("pagination[page]", &page.to_string())
            .append_pair("pagination[pageSize]", &self.page_size.to_string());
        Ok(url)
    }

    async fn fetch_page(&self, session: &Session, page: u32) -> Result<HistoryPage, LoadError> {
        let url = self.request_url(page)?;
        debug!(url = %url, "loading message history page");

        let response = self
            .http
            .get(url)
            .bearer_auth(&session.token)
            .send()
            .await
            .map_err(|err| LoadError::unreachable(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| LoadError::unreachable(err.to_string()))?;

        if !status.is_success() {
            warn!(status = status.as_u16(), "history request failed");
            return Err(LoadError::Unreachable {
                status: Some(status.as_u16()),
                message: service_error_message(&body).unwrap_or_else(|| status.to_string()),
            });
        }

        parse_history_page(&body)
    }
}

impl HistorySource for HttpHistoryLoader {
    /// Walks every page the service reports, oldest first.
    async fn load(&self, session: &Session) -> Result<Vec<Message>, LoadError> {
        let first = self.fetch_page(session, 1).await?;
        let page_count = first.page_count.min(MAX_PAGES);
        if first.page_count > MAX_PAGES {
            warn!(pages = first.page_count, "history truncated to the first pages");
        }

        let mut messages = first.messages;
        for page in 2..=page_count {
            let next = self.fetch_page(session, page).await?;
            if next.messages.is_empty() {
                break;
            }
            messages.extend(next.messages);
        }

        debug!(count = messages.len(), pages = page_count, "message history loaded");
        Ok(messages)
    }
}

struct HistoryPage {
    messages: Vec<Message>,
    page_count: u32,
}

#[derive(Deserialize)]
struct HistoryEnvelope {
    data: Option<Vec<MessageRecord>>,
    meta: Option<HistoryMeta>,
}

#[derive(Deserialize)]
struct HistoryMeta {
    pagination: Option<Pagination>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pagination {
    page_count: Option<u32>,
}

#[derive(Deserialize)]
struct MessageRecord {
    id: Option<Value>,
    attributes: Option<MessageAttributes>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageAttributes {
    content: Option<String>,
    created_at: Option<String>,
    sender: Option<SenderRelation>,
}

#[derive(Deserialize)]
struct SenderRelation {
    data: Option<SenderRecord>,
}

#[derive(Deserialize)]
struct SenderRecord {
    id: UserId,
    attributes: Option<SenderAttributes>,
}

#[derive(Deserialize)]
struct SenderAttributes {
    username: Option<String>,
}

/// Validate one history response page into canonical messages.
pub fn parse_history(body: &str) -> Result<Vec<Message>, LoadError> {
    parse_history_page(body).map(|page| page.messages)
}

fn parse_history_page(body: &str) -> Result<HistoryPage, LoadError> {
    let envelope: HistoryEnvelope =
        serde_json::from_str(body).map_err(|err| LoadError::malformed(err.to_string()))?;
    let records = envelope
        .data
        .ok_or_else(|| LoadError::malformed("response has no 'data' collection"))?;

    let messages = records
        .into_iter()
        .enumerate()
        .map(|(index, record)| {
            record_to_message(record)
                .map_err(|field| LoadError::malformed(format!("record {index}: {field}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let page_count = envelope
        .meta
        .and_then(|meta| meta.pagination)
        .and_then(|pagination| pagination.page_count)
        .unwrap_or(1)
        .max(1);

    Ok(HistoryPage {
        messages,
        page_count,
    })
}

fn record_to_message(record: MessageRecord) -> Result<Message, &'static str> {
    let id = record
        .id
        .as_ref()
        .and_then(server_id_from_value)
        .ok_or("missing id")?;
    let attributes = record.attributes.ok_or("missing attributes")?;
    let text = attributes
        .content
        .filter(|content| !content.trim().is_empty())
        .ok_or("missing content")?;
    let timestamp_ms = attributes
        .created_at
        .as_deref()
        .and_then(parse_rfc3339_ms)
        .ok_or("missing or invalid createdAt")?;
    let sender = attributes
        .sender
        .and_then(|relation| relation.data)
        .ok_or("missing sender")?;
    let sender_name = sender
        .attributes
        .and_then(|attributes| attributes.username)
        .filter(|name| !name.trim().is_empty())
        .ok_or("missing sender username")?;

    Ok(Message {
        id: MessageId::Server(id),
        text,
        sender_id: sender.id,
        sender_name,
        timestamp_ms,
    })
}
