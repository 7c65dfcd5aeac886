use axum::extract::Request;
use http::Method;
use std::sync::Arc;
use surkit::HttpHandler;

use crate::api::rest::handlers;
use crate::domain::service::BridgeService;

/// Bridge routes. `POST /` shares the handler so a missing topic yields 400
/// rather than a routing 404.
pub fn http_handlers(service: Arc<BridgeService>) -> Vec<HttpHandler> {
    let with_topic = service.clone();
    vec![
        HttpHandler::new(Method::POST, "/{topic}", move |req: Request| {
            handlers::forward(with_topic.clone(), req)
        }),
        HttpHandler::new(Method::POST, "/", move |req: Request| {
            handlers::forward(service.clone(), req)
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use axum::body::Body;
    use bytes::Bytes;
    use http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use surkit::broker::Publisher;
    use surkit::{BrokerError, RouterBuilder, SharedPublisher};
    use tower::ServiceExt;

    /// Records calls and answers with a fixed result.
    struct FakePublisher {
        calls: AtomicUsize,
        answer: fn(&str) -> Result<Bytes, BrokerError>,
    }

    #[async_trait::async_trait]
    impl Publisher for FakePublisher {
        async fn request(
            &self,
            subject: &str,
            _payload: Bytes,
            _timeout: Duration,
        ) -> Result<Bytes, BrokerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.answer)(subject)
        }

        async fn publish(&self, _subject: &str, _payload: Bytes) -> Result<(), BrokerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn bridge_router(
        answer: fn(&str) -> Result<Bytes, BrokerError>,
    ) -> (axum::Router, Arc<FakePublisher>) {
        let fake = Arc::new(FakePublisher {
            calls: AtomicUsize::new(0),
            answer,
        });
        let publisher: SharedPublisher = fake.clone();
        let service = Arc::new(BridgeService::new(publisher, &BridgeConfig::default()));

        let mut builder = RouterBuilder::new();
        for handler in http_handlers(service) {
            builder.add("bridge", handler).unwrap();
        }
        (builder.build().0, fake)
    }

    async fn post(
        router: axum::Router,
        uri: &str,
        body: &'static str,
    ) -> (StatusCode, Option<String>, String) {
        let res = router
            .oneshot(
                http::Request::builder()
                    .method(Method::POST)
                    .uri(uri)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = res.status();
        let content_type = res
            .headers()
            .get(http::header::CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    fn ok_reply(subject: &str) -> Result<Bytes, BrokerError> {
        assert_eq!(subject, "orders");
        Ok(Bytes::from_static(b"{\"ok\":true}"))
    }

    #[tokio::test]
    async fn reply_is_returned_verbatim() {
        let (router, fake) = bridge_router(ok_reply);
        let (status, content_type, body) = post(router, "/orders", "{\"id\":1}").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("application/json"));
        assert_eq!(body, "{\"ok\":true}");
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_topic_never_reaches_broker() {
        let (router, fake) = bridge_router(ok_reply);
        let (status, _, body) = post(router, "/", "{\"id\":1}").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Invalid URL path: missing topic");
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wildcard_topic_is_rejected() {
        let (router, fake) = bridge_router(ok_reply);
        let (status, _, _) = post(router, "/orders.%3E", "{}").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_json_never_reaches_broker() {
        let (router, fake) = bridge_router(ok_reply);
        let (status, _, body) = post(router, "/orders", "{\"a\":}").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Invalid JSON in request body");
        assert_eq!(fake.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn broker_timeout_is_gateway_timeout() {
        let (router, fake) = bridge_router(|_| Err(BrokerError::RequestTimeout(Duration::from_secs(15))));
        let (status, _, body) = post(router.clone(), "/orders", "{}").await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body, "Request to broker timed out");

        // Each attempt times out independently.
        let (status, _, _) = post(router, "/orders", "{}").await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn no_responders_is_internal_error() {
        let (router, _) = bridge_router(|s| Err(BrokerError::NoResponders(s.to_string())));
        let (status, _, body) = post(router, "/orders", "{}").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "no responders available for request");
    }
}
