//! # HTTP Flows
//!
//! HTTP requests run on short-lived connections against the same cache as
//! websocket clients. Resources already cached for a websocket client are
//! served to HTTP without another get request, and calls made over HTTP
//! reach websocket subscribers through the resulting events.

#[cfg(test)]
mod tests {
    use super::super::{Gateway, FRAME_TIMEOUT};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use axum::response::Response;
    use serde_json::json;
    use tower::ServiceExt;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn request(method: &str, uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    // =============================================================================
    // SHARED CACHE
    // =============================================================================

    #[tokio::test]
    async fn test_get_served_from_cache() {
        let gw = Gateway::start();
        let mut client = gw.client();

        client.send(json!({"id": 1, "method": "subscribe.test.m"}));
        gw.grant("test.m").await;
        gw.respond("get.test.m", json!({"result": {"model": {"v": 1}}}))
            .await;
        client.next_frame().await;

        gw.bus.publish("event.test.m.change", r#"{"values":{"v":2}}"#);
        client.next_frame().await;

        let task = tokio::spawn(gw.router().oneshot(request("GET", "/api/test/m", "")));
        gw.grant("test.m").await;
        let response = tokio::time::timeout(FRAME_TIMEOUT, task)
            .await
            .expect("served without a get request")
            .expect("task")
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"v": 2}));
        assert!(gw.bus.pending_requests().is_empty());

        // Only the websocket client remains
        settle().await;
        assert_eq!(gw.ctx.registry.len(), 1);
        assert_eq!(gw.ctx.cache.event_subscription("test.m").map(|h| h.count()), Some(1));
    }

    #[tokio::test]
    async fn test_get_loads_uncached_references() {
        let gw = Gateway::start();

        let task = tokio::spawn(gw.router().oneshot(request("GET", "/api/test/list", "")));
        gw.grant("test.list").await;
        gw.respond(
            "get.test.list",
            json!({"result": {"collection": [{"rid": "test.item.1"}, {"rid": "test.item.2"}]}}),
        )
        .await;
        gw.respond("get.test.item.1", json!({"result": {"model": {"n": 1}}}))
            .await;
        gw.respond("get.test.item.2", json!({"error": {"code": "system.notFound", "message": "Not found"}}))
            .await;

        let response = task.await.expect("task").expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!([
                {"href": "/api/test/item/1", "model": {"n": 1}},
                {"href": "/api/test/item/2", "error": {"code": "system.notFound", "message": "Not found"}}
            ])
        );
        assert!(gw.ctx.registry.is_empty());
    }

    // =============================================================================
    // CALLS
    // =============================================================================

    #[tokio::test]
    async fn test_http_call_reaches_websocket_subscriber() {
        let gw = Gateway::start();
        let mut client = gw.client();

        client.send(json!({"id": 1, "method": "subscribe.test.m"}));
        gw.grant("test.m").await;
        gw.respond("get.test.m", json!({"result": {"model": {"v": 1}}}))
            .await;
        client.next_frame().await;

        let task = tokio::spawn(
            gw.router()
                .oneshot(request("POST", "/api/test/m/set", r#"{"v":5}"#)),
        );
        gw.respond("access.test.m", json!({"result": {"call": "set"}}))
            .await;
        let call = gw
            .bus
            .next_request("call.test.m.set")
            .await
            .expect("call request");
        let payload: serde_json::Value =
            serde_json::from_str(call.payload_str()).expect("call payload");
        assert_eq!(payload["params"], json!({"v": 5}));

        // The service applies the call before answering
        gw.bus.publish("event.test.m.change", r#"{"values":{"v":5}}"#);
        call.respond(r#"{"result":null}"#);

        let response = task.await.expect("task").expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(
            client.next_frame().await,
            json!({"event": "test.m.change", "data": {"values": {"v": 5}}})
        );
    }

    #[tokio::test]
    async fn test_http_new_returns_location() {
        let gw = Gateway::start();

        let task = tokio::spawn(
            gw.router()
                .oneshot(request("POST", "/api/test/list/new", r#"{"name":"x"}"#)),
        );
        gw.respond("access.test.list", json!({"result": {"call": "*"}}))
            .await;
        gw.respond("call.test.list.new", json!({"resource": {"rid": "test.item.7"}}))
            .await;

        let response = task.await.expect("task").expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get(header::LOCATION).expect("location"),
            "/api/test/item/7"
        );
    }

    #[tokio::test]
    async fn test_http_access_denied() {
        let gw = Gateway::start();

        let task = tokio::spawn(gw.router().oneshot(request("GET", "/api/test/secret", "")));
        gw.respond("access.test.secret", json!({"result": {"get": false}}))
            .await;

        let response = task.await.expect("task").expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["code"], "system.accessDenied");
        assert!(gw.ctx.registry.is_empty());
    }
}
