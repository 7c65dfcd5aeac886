use axum::extract::{ConnectInfo, RawPathParams, Request};
use axum::response::{IntoResponse, Response};
use axum::RequestPartsExt;
use bytes::Bytes;
use http::{header, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::api::rest::error::domain_error_to_status;
use crate::domain::error::DomainError;
use crate::domain::service::BridgeService;

pub const TOPIC_PARAM: &str = "topic";

/// `POST /{topic}`: forward the JSON body to the broker subject `topic` and
/// return the reply verbatim.
pub async fn forward(svc: Arc<BridgeService>, req: Request) -> Response {
    let started = Instant::now();
    let (mut parts, body) = req.into_parts();

    let remote_addr = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let params = parts.extract::<RawPathParams>().await.ok();
    let raw_topic = params.as_ref().and_then(|params| {
        params
            .iter()
            .find(|(key, _)| *key == TOPIC_PARAM)
            .map(|(_, value)| value)
    });

    let topic = match svc.validate_topic(raw_topic) {
        Ok(topic) => topic.to_string(),
        Err(err) => return rejected(err, &remote_addr, started),
    };

    let payload = match axum::body::to_bytes(body, svc.max_body_bytes()).await {
        Ok(payload) => payload,
        Err(e) => {
            let err = DomainError::UnreadableBody {
                message: e.to_string(),
            };
            return rejected(err, &remote_addr, started);
        }
    };

    info!(
        topic = %topic,
        remote_addr = %remote_addr,
        payload_size = payload.len(),
        "bridge request started"
    );

    match svc.forward(&topic, payload).await {
        Ok(reply) => {
            info!(
                topic = %topic,
                elapsed_ms = started.elapsed().as_millis() as u64,
                response_size = reply.len(),
                outcome = "ok",
                "bridge request completed"
            );
            json_reply(reply)
        }
        Err(err) => {
            let (status, text) = domain_error_to_status(&err);
            warn!(
                topic = %topic,
                elapsed_ms = started.elapsed().as_millis() as u64,
                response_size = text.len(),
                outcome = err.outcome(),
                status = status.as_u16(),
                error = %err,
                "bridge request failed"
            );
            (status, text).into_response()
        }
    }
}

fn rejected(err: DomainError, remote_addr: &str, started: Instant) -> Response {
    let (status, text) = domain_error_to_status(&err);
    warn!(
        remote_addr = %remote_addr,
        elapsed_ms = started.elapsed().as_millis() as u64,
        outcome = err.outcome(),
        status = status.as_u16(),
        error = %err,
        "bridge request rejected"
    );
    (status, text).into_response()
}

fn json_reply(reply: Bytes) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        reply,
    )
        .into_response()
}
