use actix_web::{get, post, web, Responder, Scope};
use serde::{Deserialize, Serialize};

use crate::{
    engine::Engine,
    message::{DeadLetterEntry, DeadLetterFilter},
};

const DEFAULT_PAGE: u32 = 100;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    channel: Option<String>,
    group: Option<String>,
    limit: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse {
    pub entries: Vec<DeadLetterEntry>,
}

#[get("")]
async fn list(engine: web::Data<Engine>, query: web::Query<ListQuery>) -> actix_web::Result<impl Responder> {
    let ListQuery {
        channel,
        group,
        limit,
    } = query.into_inner();

    let filter = DeadLetterFilter::builder()
        .maybe_channel(channel)
        .maybe_group(group)
        .limit(limit.unwrap_or(DEFAULT_PAGE))
        .build();

    let entries = engine.list_dead_letters(&filter).await?;

    Ok(web::Json(ListResponse { entries }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RequeueResponse {
    pub requeued: u64,
}

#[post("/requeue")]
async fn requeue(
    engine: web::Data<Engine>,
    filter: web::Json<DeadLetterFilter>,
) -> actix_web::Result<impl Responder> {
    let requeued = engine.requeue_from_dlq(&filter).await?;

    Ok(web::Json(RequeueResponse { requeued }))
}

pub fn service() -> Scope {
    web::scope("/dlq").service(list).service(requeue)
}
