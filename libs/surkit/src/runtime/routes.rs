//! Turns module route bindings into one axum `Router`, rejecting bindings
//! that would make axum panic (bad syntax, duplicates, overlapping shapes).

use crate::contracts::HttpHandler;
use crate::runtime::HostError;
use axum::extract::Request;
use axum::routing::{on, MethodFilter};
use axum::Router;
use http::Method;
use std::collections::HashMap;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

/// A route as registered on the HTTP listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub module: &'static str,
    pub method: Method,
    pub path: String,
}

#[derive(Default)]
pub struct RouterBuilder {
    router: Router,
    routes: Vec<RouteInfo>,
    // Normalized shape ("/{}") → first concrete path registered with it.
    shapes: HashMap<String, String>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, module: &'static str, binding: HttpHandler) -> Result<(), HostError> {
        let HttpHandler {
            method,
            path,
            handler,
        } = binding;
        let invalid = |reason: String| HostError::InvalidRoute {
            module,
            method: method.clone(),
            path: path.clone(),
            reason,
        };

        let shape = validate_path(&path).map_err(invalid)?;
        let filter = MethodFilter::try_from(method.clone())
            .map_err(|_| invalid("unsupported HTTP method".to_string()))?;

        if let Some(existing) = self.shapes.get(&shape) {
            if *existing != path {
                return Err(invalid(format!("overlaps with '{existing}'")));
            }
        }
        if let Some(first) = self
            .routes
            .iter()
            .find(|r| r.method == method && r.path == path)
        {
            return Err(HostError::DuplicateRoute {
                method,
                path,
                first: first.module,
                second: module,
            });
        }

        tracing::debug!(module, %method, path = %path, "registering route");
        let service = on(filter, move |req: Request| handler(req));
        self.router = std::mem::take(&mut self.router).route(&path, service);
        self.shapes.entry(shape).or_insert_with(|| path.clone());
        self.routes.push(RouteInfo {
            module,
            method,
            path,
        });
        Ok(())
    }

    pub fn routes(&self) -> &[RouteInfo] {
        &self.routes
    }

    /// Wrap the routes with request-id, tracing and panic recovery layers.
    pub fn build(self) -> (Router, Vec<RouteInfo>) {
        use tracing::field::Empty;

        let router = self
            .router
            .layer(CatchPanicLayer::new())
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(|req: &axum::http::Request<axum::body::Body>| {
                        let rid = req
                            .headers()
                            .get("x-request-id")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("n/a");
                        tracing::info_span!(
                            "http_request",
                            method = %req.method(),
                            uri = %req.uri().path(),
                            request_id = %rid,
                            status = Empty,
                            latency_ms = Empty,
                        )
                    })
                    .on_response(
                        |res: &axum::http::Response<axum::body::Body>,
                         latency: std::time::Duration,
                         span: &tracing::Span| {
                            span.record("status", res.status().as_u16());
                            span.record("latency_ms", latency.as_millis() as u64);
                        },
                    ),
            )
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));
        (router, self.routes)
    }
}

/// Check route syntax (`/literal/{param}/{*rest}`) and return the
/// parameter-agnostic shape used for overlap detection.
fn validate_path(path: &str) -> Result<String, String> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err("path must start with '/'".to_string());
    };
    if rest.is_empty() {
        return Ok("/".to_string());
    }

    let segments: Vec<&str> = rest.split('/').collect();
    let last = segments.len() - 1;
    let mut shape = String::with_capacity(path.len());
    for (i, seg) in segments.iter().enumerate() {
        shape.push('/');
        if seg.starts_with(':') || seg.starts_with('*') {
            return Err(format!(
                "segment '{seg}' uses unsupported parameter syntax; use '{{name}}'"
            ));
        }
        if let Some(inner) = seg.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            let (name, wildcard) = match inner.strip_prefix('*') {
                Some(name) => (name, true),
                None => (inner, false),
            };
            if !is_param_name(name) {
                return Err(format!("invalid parameter name in '{seg}'"));
            }
            if wildcard && i != last {
                return Err("wildcard parameter must be the last segment".to_string());
            }
            shape.push_str(if wildcard { "{*}" } else { "{}" });
        } else if seg.contains(['{', '}']) {
            return Err(format!("parameter '{seg}' must span a whole segment"));
        } else if seg.is_empty() && i != last {
            return Err("empty path segment".to_string());
        } else {
            shape.push_str(seg);
        }
    }
    Ok(shape)
}

fn is_param_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::response::IntoResponse;
    use tower::ServiceExt;

    fn ok_handler(method: Method, path: &str) -> HttpHandler {
        HttpHandler::new(method, path, |_req| async { "ok".into_response() })
    }

    #[test]
    fn path_validation() {
        assert_eq!(validate_path("/").unwrap(), "/");
        assert_eq!(validate_path("/{topic}").unwrap(), "/{}");
        assert_eq!(validate_path("/api/{id}/items").unwrap(), "/api/{}/items");
        assert_eq!(validate_path("/files/{*rest}").unwrap(), "/files/{*}");

        assert!(validate_path("orders").is_err());
        assert!(validate_path("/:topic").is_err());
        assert!(validate_path("/*rest").is_err());
        assert!(validate_path("/{*rest}/tail").is_err());
        assert!(validate_path("/pre{fix}").is_err());
        assert!(validate_path("/{1bad}").is_err());
        assert!(validate_path("/a//b").is_err());
    }

    #[test]
    fn duplicate_method_and_path_is_rejected() {
        let mut b = RouterBuilder::new();
        b.add("first", ok_handler(Method::POST, "/{topic}")).unwrap();
        let err = b
            .add("second", ok_handler(Method::POST, "/{topic}"))
            .unwrap_err();
        assert!(matches!(
            err,
            HostError::DuplicateRoute { first: "first", second: "second", .. }
        ));
    }

    #[test]
    fn same_path_different_methods_is_allowed() {
        let mut b = RouterBuilder::new();
        b.add("m", ok_handler(Method::POST, "/items")).unwrap();
        b.add("m", ok_handler(Method::GET, "/items")).unwrap();
        assert_eq!(b.routes().len(), 2);
    }

    #[test]
    fn overlapping_parameter_names_are_rejected() {
        let mut b = RouterBuilder::new();
        b.add("a", ok_handler(Method::POST, "/{topic}")).unwrap();
        let err = b.add("b", ok_handler(Method::GET, "/{name}")).unwrap_err();
        assert!(matches!(err, HostError::InvalidRoute { module: "b", .. }));
    }

    #[tokio::test]
    async fn built_router_serves_and_sets_request_id() {
        let mut b = RouterBuilder::new();
        b.add("m", ok_handler(Method::POST, "/{topic}")).unwrap();
        let (router, routes) = b.build();
        assert_eq!(routes[0].path, "/{topic}");

        let res = router
            .clone()
            .oneshot(
                http::Request::post("/orders")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), http::StatusCode::OK);
        assert!(res.headers().contains_key("x-request-id"));

        let res = router
            .oneshot(http::Request::get("/orders").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), http::StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn handler_panic_becomes_500() {
        async fn boom(_req: Request) -> axum::response::Response {
            panic!("boom")
        }

        let mut b = RouterBuilder::new();
        b.add("m", HttpHandler::new(Method::GET, "/boom", boom))
            .unwrap();
        let (router, _) = b.build();
        let res = router
            .oneshot(http::Request::get("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
    }
}
