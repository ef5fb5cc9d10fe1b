use actix_web::{get, post, web, Responder, Scope};
use serde::{Deserialize, Serialize};

use crate::{
    engine::Engine,
    message::{Message, MessageId, PublishOptions},
};

const DEFAULT_PAGE: u32 = 100;
const MAX_PAGE: u32 = 1_000;

/// A log entry as shown to operators. JSON payloads are inlined, anything
/// else is rendered as (lossy) UTF-8 text.
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageView {
    pub id: MessageId,
    pub channel: String,
    pub attempt: u32,
    pub dedup_key: Option<String>,
    pub created_at: i64,
    pub payload: serde_json::Value,
}

impl From<Message> for MessageView {
    fn from(message: Message) -> Self {
        let payload = serde_json::from_slice(&message.payload).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&message.payload).into_owned())
        });

        Self {
            id: message.id,
            channel: message.channel,
            attempt: message.attempt,
            dedup_key: message.dedup_key,
            created_at: message.created_at,
            payload,
        }
    }
}

#[get("/{channel}/stats")]
async fn stats(engine: web::Data<Engine>, path: web::Path<String>) -> actix_web::Result<impl Responder> {
    Ok(web::Json(engine.stats(&path).await?))
}

#[derive(Debug, Deserialize)]
pub struct RangeQuery {
    after: Option<MessageId>,
    limit: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RangeResponse {
    pub messages: Vec<MessageView>,
}

#[get("/{channel}/messages")]
async fn range(
    engine: web::Data<Engine>,
    path: web::Path<String>,
    query: web::Query<RangeQuery>,
) -> actix_web::Result<impl Responder> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE);

    let messages = engine
        .range(&path, query.after, limit)
        .await?
        .into_iter()
        .map(MessageView::from)
        .collect();

    Ok(web::Json(RangeResponse { messages }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishRequest {
    pub payload: serde_json::Value,
    pub delay_ms: Option<u64>,
    pub deliver_at: Option<chrono::DateTime<chrono::Utc>>,
    pub dedup_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    /// The log id, or `SCHEDULED` for delayed messages.
    pub receipt: String,
    pub id: Option<MessageId>,
}

#[post("/{channel}/messages")]
async fn publish(
    engine: web::Data<Engine>,
    path: web::Path<String>,
    body: web::Json<PublishRequest>,
) -> actix_web::Result<impl Responder> {
    let PublishRequest {
        payload,
        delay_ms,
        deliver_at,
        dedup_key,
    } = body.into_inner();

    let opts = PublishOptions::builder()
        .maybe_delay(delay_ms.map(std::time::Duration::from_millis))
        .maybe_deliver_at(deliver_at)
        .maybe_dedup_key(dedup_key)
        .build();

    let receipt = engine.publish_json(&path, &payload, opts).await?;

    Ok(web::Json(PublishResponse {
        receipt: receipt.to_string(),
        id: receipt.id(),
    }))
}

pub fn service() -> Scope {
    web::scope("/channels")
        .service(stats)
        .service(range)
        .service(publish)
}
