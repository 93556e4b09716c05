//! # Lifecycle Flows
//!
//! How subscriptions end:
//!
//! - **Idle tear-down**: an unused resource keeps its bus subscription for
//!   the unsubscribe delay, then releases it
//! - **Reaccess**: a token change that denies access unsubscribes only the
//!   affected client
//! - **Reference GC**: indirect subscriptions are released once nothing
//!   reachable from a direct subscription refers to them
//! - **Disconnect**: a closed connection releases everything it held

#[cfg(test)]
mod tests {
    use super::super::Gateway;
    use res_gateway::domain::error::codes;
    use res_gateway::OutFrame;
    use serde_json::json;
    use std::time::Duration;

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    // =============================================================================
    // IDLE TEAR-DOWN
    // =============================================================================

    #[tokio::test(start_paused = true)]
    async fn test_idle_resource_released_after_delay() {
        let gw = Gateway::start();
        let mut client = gw.client();

        client.send(json!({"id": 1, "method": "subscribe.test.a"}));
        gw.grant("test.a").await;
        gw.respond("get.test.a", json!({"result": {"model": {"n": 1}}}))
            .await;
        client.next_frame().await;

        client.send(json!({"id": 2, "method": "unsubscribe.test.a"}));
        assert_eq!(client.next_frame().await, json!({"id": 2}));
        settle().await;

        tokio::time::advance(Duration::from_millis(4999)).await;
        settle().await;
        assert!(gw.bus.has_subscription("event.test.a.*"));
        assert!(gw.ctx.cache.event_subscription("test.a").is_some());

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert!(!gw.bus.has_subscription("event.test.a.*"));
        assert!(gw.ctx.cache.event_subscription("test.a").is_none());
        assert_eq!(gw.ctx.cache.hub_count(), 0);

        // Subscribing again starts from scratch
        client.send(json!({"id": 3, "method": "subscribe.test.a"}));
        gw.grant("test.a").await;
        gw.respond("get.test.a", json!({"result": {"model": {"n": 2}}}))
            .await;
        assert_eq!(
            client.next_frame().await,
            json!({"id": 3, "result": {"models": {"test.a": {"n": 2}}}})
        );
        let issued = gw
            .bus
            .subscribe_history()
            .iter()
            .filter(|p| p.as_str() == "event.test.a.*")
            .count();
        assert_eq!(issued, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_within_delay_keeps_cache() {
        let gw = Gateway::start();
        let mut client = gw.client();

        client.send(json!({"id": 1, "method": "subscribe.test.a"}));
        gw.grant("test.a").await;
        gw.respond("get.test.a", json!({"result": {"model": {"n": 1}}}))
            .await;
        client.next_frame().await;
        client.send(json!({"id": 2, "method": "unsubscribe.test.a"}));
        client.next_frame().await;
        settle().await;

        tokio::time::advance(Duration::from_secs(3)).await;
        client.send(json!({"id": 3, "method": "subscribe.test.a"}));
        gw.grant("test.a").await;
        assert_eq!(
            client.next_frame().await,
            json!({"id": 3, "result": {"models": {"test.a": {"n": 1}}}})
        );

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert!(gw.bus.has_subscription("event.test.a.*"));
        assert_eq!(gw.bus.subscription_count("event.test.a.*"), 1);
    }

    // =============================================================================
    // REACCESS
    // =============================================================================

    #[tokio::test]
    async fn test_token_change_denies_only_affected_client() {
        let gw = Gateway::start();
        let mut denied = gw.client();
        let mut other = gw.client();

        for client in [&denied, &other] {
            client.send(json!({"id": 1, "method": "subscribe.test.sec"}));
        }
        gw.grant("test.sec").await;
        gw.respond("get.test.sec", json!({"result": {"model": {"secret": 1}}}))
            .await;
        gw.grant("test.sec").await;
        denied.next_frame().await;
        other.next_frame().await;
        assert_eq!(denied.counts("test.sec").await, Some((1, 0)));

        let cid = denied.handle.cid().to_string();
        gw.bus
            .publish(&format!("conn.{}.token", cid), r#"{"token":{"role":"guest"}}"#);
        let access = gw
            .bus
            .next_request("access.test.sec")
            .await
            .expect("access request");
        assert!(access.payload_str().contains(r#""token":{"role":"guest"}"#));
        access.respond(r#"{"result":{"get":false}}"#);

        let frame = denied.next_frame().await;
        assert_eq!(frame["event"], "test.sec.unsubscribe");
        assert_eq!(frame["data"]["reason"]["code"], codes::ACCESS_DENIED);
        let counts = denied.counts("test.sec").await;
        assert!(matches!(counts, None | Some((0, _))), "{:?}", counts);

        gw.bus.publish("event.test.sec.change", r#"{"values":{"secret":2}}"#);
        assert_eq!(
            other.next_frame().await,
            json!({"event": "test.sec.change", "data": {"values": {"secret": 2}}})
        );
        denied.assert_quiet().await;
    }

    #[tokio::test]
    async fn test_access_reset_keeps_granted_client() {
        let gw = Gateway::start();
        let mut client = gw.client();

        client.send(json!({"id": 1, "method": "subscribe.test.sec"}));
        gw.grant("test.sec").await;
        gw.respond("get.test.sec", json!({"result": {"model": {}}}))
            .await;
        client.next_frame().await;

        gw.bus.publish("system.reset", r#"{"access":["test.>"]}"#);
        gw.grant("test.sec").await;
        client.assert_quiet().await;
        assert_eq!(client.counts("test.sec").await, Some((1, 0)));
    }

    // =============================================================================
    // REFERENCE GC
    // =============================================================================

    #[tokio::test]
    async fn test_cycle_released_on_unsubscribe() {
        let gw = Gateway::start();
        let mut client = gw.client();

        client.send(json!({"id": 1, "method": "subscribe.test.a"}));
        gw.grant("test.a").await;
        gw.respond("get.test.a", json!({"result": {"model": {"b": {"rid": "test.b"}}}}))
            .await;
        gw.respond("get.test.b", json!({"result": {"model": {"a": {"rid": "test.a"}}}}))
            .await;
        assert_eq!(
            client.next_frame().await,
            json!({"id": 1, "result": {"models": {
                "test.a": {"b": {"rid": "test.b"}},
                "test.b": {"a": {"rid": "test.a"}}
            }}})
        );
        assert_eq!(client.counts("test.a").await, Some((1, 1)));
        assert_eq!(client.counts("test.b").await, Some((0, 1)));

        client.send(json!({"id": 2, "method": "unsubscribe.test.a"}));
        assert_eq!(client.next_frame().await, json!({"id": 2}));
        assert!(client.rids().await.is_empty());
    }

    #[tokio::test]
    async fn test_shared_reference_survives_partial_unsubscribe() {
        let gw = Gateway::start();
        let mut client = gw.client();

        client.send(json!({"id": 1, "method": "subscribe.test.a"}));
        gw.grant("test.a").await;
        gw.respond("get.test.a", json!({"result": {"model": {"r": {"rid": "test.shared"}}}}))
            .await;
        gw.respond("get.test.shared", json!({"result": {"model": {"v": 1}}}))
            .await;
        client.next_frame().await;

        client.send(json!({"id": 2, "method": "subscribe.test.c"}));
        gw.grant("test.c").await;
        gw.respond("get.test.c", json!({"result": {"collection": [{"rid": "test.shared"}]}}))
            .await;
        // Already sent with test.a
        assert_eq!(
            client.next_frame().await,
            json!({"id": 2, "result": {"collections": {"test.c": [{"rid": "test.shared"}]}}})
        );
        assert_eq!(client.counts("test.shared").await, Some((0, 2)));

        client.send(json!({"id": 3, "method": "unsubscribe.test.a"}));
        client.next_frame().await;
        assert_eq!(client.rids().await, vec!["test.c", "test.shared"]);
        assert_eq!(client.counts("test.shared").await, Some((0, 1)));
    }

    #[tokio::test]
    async fn test_changed_reference_is_released() {
        let gw = Gateway::start();
        let mut client = gw.client();

        client.send(json!({"id": 1, "method": "subscribe.test.a"}));
        gw.grant("test.a").await;
        gw.respond("get.test.a", json!({"result": {"model": {"b": {"rid": "test.b"}}}}))
            .await;
        gw.respond("get.test.b", json!({"result": {"model": {"x": 1}}}))
            .await;
        client.next_frame().await;

        gw.bus.publish("event.test.a.change", r#"{"values":{"b":null}}"#);
        assert_eq!(
            client.next_frame().await,
            json!({"event": "test.a.change", "data": {"values": {"b": null}}})
        );
        client.sync().await;
        assert_eq!(client.rids().await, vec!["test.a"]);
    }

    #[tokio::test]
    async fn test_added_reference_is_sent_with_change() {
        let gw = Gateway::start();
        let mut client = gw.client();

        client.send(json!({"id": 1, "method": "subscribe.test.a"}));
        gw.grant("test.a").await;
        gw.respond("get.test.a", json!({"result": {"model": {}}}))
            .await;
        client.next_frame().await;

        gw.bus
            .publish("event.test.a.change", r#"{"values":{"c":{"rid":"test.c"}}}"#);
        gw.respond("get.test.c", json!({"result": {"model": {"x": 1}}}))
            .await;
        assert_eq!(
            client.next_frame().await,
            json!({"event": "test.a.change", "data": {
                "values": {"c": {"rid": "test.c"}},
                "models": {"test.c": {"x": 1}}
            }})
        );
        assert_eq!(client.counts("test.c").await, Some((0, 1)));
    }

    // =============================================================================
    // DISCONNECT
    // =============================================================================

    #[tokio::test]
    async fn test_disconnect_releases_connection() {
        let gw = Gateway::start();
        let mut client = gw.client();
        let cid = client.handle.cid().to_string();

        client.send(json!({"id": 1, "method": "subscribe.test.a"}));
        gw.grant("test.a").await;
        gw.respond("get.test.a", json!({"result": {"model": {}}}))
            .await;
        client.next_frame().await;
        assert_eq!(gw.ctx.registry.len(), 1);
        assert_eq!(gw.ctx.cache.event_subscription("test.a").map(|h| h.count()), Some(1));

        client.handle.disconnect("Server is shutting down").await;
        assert_eq!(
            client.next_out().await,
            OutFrame::Close("Server is shutting down".into())
        );
        assert!(gw.ctx.registry.is_empty());
        assert!(!gw.bus.has_subscription(&format!("conn.{}.*", cid)));
        assert!(!client.handle.handle_message("{}".into()));
        settle().await;
        assert_eq!(gw.ctx.cache.event_subscription("test.a").map(|h| h.count()), Some(0));
    }
}
