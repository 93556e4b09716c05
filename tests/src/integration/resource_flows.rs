//! # Resource Flows
//!
//! Loading resources into the cache and keeping client replicas in sync:
//!
//! 1. **Model load + change**: a client sees the model once, then deltas
//! 2. **Collection add/remove**: index events keep the replica in range
//! 3. **Query normalization**: equivalent queries share one cached resource
//! 4. **Reset**: a reloaded collection is diffed into remove/add events
//! 5. **Fan-out**: several clients share one bus subscription and see the
//!    same event order

#[cfg(test)]
mod tests {
    use super::super::Gateway;
    use res_gateway::codec::Value as CacheValue;
    use res_gateway::rescache::Snapshot;
    use serde_json::json;

    fn primitive(v: serde_json::Value) -> CacheValue {
        CacheValue::Primitive(v)
    }

    // =============================================================================
    // MODEL
    // =============================================================================

    #[tokio::test]
    async fn test_model_load_and_change() {
        let gw = Gateway::start();
        let mut client = gw.client();

        client.send(json!({"id": 1, "method": "subscribe.test.foo"}));
        gw.grant("test.foo").await;
        let get = gw.bus.next_request("get.test.foo").await.expect("get request");
        assert_eq!(get.payload_str(), "{}");
        get.respond(r#"{"result":{"model":{"a":1,"b":2}}}"#.to_string());

        assert_eq!(
            client.next_frame().await,
            json!({"id": 1, "result": {"models": {"test.foo": {"a": 1, "b": 2}}}})
        );

        gw.bus
            .publish("event.test.foo.change", r#"{"values":{"b":3}}"#);
        assert_eq!(
            client.next_frame().await,
            json!({"event": "test.foo.change", "data": {"values": {"b": 3}}})
        );
        client.assert_quiet().await;

        let rs = gw
            .ctx
            .cache
            .event_subscription("test.foo")
            .and_then(|hub| hub.resource_subscription(""))
            .expect("cached resource");
        let Some((Snapshot::Model(model), version)) = rs.snapshot() else {
            panic!("expected model");
        };
        assert_eq!(version, 1);
        assert_eq!(model.get("a"), Some(&primitive(json!(1))));
        assert_eq!(model.get("b"), Some(&primitive(json!(3))));
    }

    #[tokio::test]
    async fn test_unchanged_values_are_not_sent() {
        let gw = Gateway::start();
        let mut client = gw.client();

        client.send(json!({"id": 1, "method": "subscribe.test.foo"}));
        gw.grant("test.foo").await;
        gw.respond("get.test.foo", json!({"result": {"model": {"a": 1}}}))
            .await;
        client.next_frame().await;

        gw.bus.publish("event.test.foo.change", r#"{"values":{"a":1}}"#);
        gw.bus.publish("event.test.foo.change", r#"{"values":{"a":2}}"#);
        assert_eq!(
            client.next_frame().await,
            json!({"event": "test.foo.change", "data": {"values": {"a": 2}}})
        );
        client.assert_quiet().await;
    }

    // =============================================================================
    // COLLECTION
    // =============================================================================

    #[tokio::test]
    async fn test_collection_add_remove() {
        let gw = Gateway::start();
        let mut client = gw.client();

        client.send(json!({"id": 1, "method": "subscribe.test.list"}));
        gw.grant("test.list").await;
        gw.respond("get.test.list", json!({"result": {"collection": ["x", "y", "z"]}}))
            .await;
        assert_eq!(
            client.next_frame().await,
            json!({"id": 1, "result": {"collections": {"test.list": ["x", "y", "z"]}}})
        );

        gw.bus.publish("event.test.list.add", r#"{"idx":1,"value":"w"}"#);
        assert_eq!(
            client.next_frame().await,
            json!({"event": "test.list.add", "data": {"idx": 1, "value": "w"}})
        );

        gw.bus.publish("event.test.list.remove", r#"{"idx":2}"#);
        assert_eq!(
            client.next_frame().await,
            json!({"event": "test.list.remove", "data": {"idx": 2}})
        );

        // Out of range
        gw.bus.publish("event.test.list.remove", r#"{"idx":3}"#);
        gw.bus.publish("event.test.list.add", r#"{"idx":4,"value":"q"}"#);
        client.assert_quiet().await;

        let rs = gw
            .ctx
            .cache
            .event_subscription("test.list")
            .and_then(|hub| hub.resource_subscription(""))
            .expect("cached resource");
        let Some((Snapshot::Collection(items), _)) = rs.snapshot() else {
            panic!("expected collection");
        };
        assert_eq!(
            *items,
            vec![primitive(json!("x")), primitive(json!("w")), primitive(json!("z"))]
        );
    }

    // =============================================================================
    // QUERY RESOURCES
    // =============================================================================

    #[tokio::test]
    async fn test_query_normalization_shares_resource() {
        let gw = Gateway::start();
        let mut client = gw.client();

        client.send(json!({"id": 1, "method": "subscribe.test.q?a=1&b=2"}));
        gw.grant("test.q").await;
        let get = gw.bus.next_request("get.test.q").await.expect("get request");
        assert_eq!(get.payload_str(), r#"{"query":"a=1&b=2"}"#);
        get.respond(r#"{"result":{"collection":[],"query":"b=2&a=1"}}"#.to_string());
        assert_eq!(
            client.next_frame().await,
            json!({"id": 1, "result": {"collections": {"test.q?a=1&b=2": []}}})
        );

        client.send(json!({"id": 2, "method": "subscribe.test.q?b=2&a=1"}));
        gw.grant("test.q").await;
        assert_eq!(
            client.next_frame().await,
            json!({"id": 2, "result": {"collections": {"test.q?b=2&a=1": []}}})
        );

        let hub = gw.ctx.cache.event_subscription("test.q").expect("hub");
        assert_eq!(hub.count(), 2);
        assert_eq!(hub.resource_count(), 1);
        assert_eq!(gw.bus.subscription_count("event.test.q.*"), 1);
        assert_eq!(gw.ctx.cache.hub_count(), 1);
    }

    // =============================================================================
    // SYSTEM RESET
    // =============================================================================

    #[tokio::test]
    async fn test_reset_collection_sends_minimal_edits() {
        let gw = Gateway::start();
        let mut client = gw.client();

        client.send(json!({"id": 1, "method": "subscribe.test.list"}));
        gw.grant("test.list").await;
        gw.respond(
            "get.test.list",
            json!({"result": {"collection": ["A", "B", "C", "D", "E"]}}),
        )
        .await;
        client.next_frame().await;

        gw.bus.publish("system.reset", r#"{"resources":["test.>"]}"#);
        gw.respond(
            "get.test.list",
            json!({"result": {"collection": ["A", "C", "D", "F", "E"]}}),
        )
        .await;

        let frame = client.next_frame().await;
        assert_eq!(frame["event"], "test.list.remove");
        assert_eq!(frame["data"]["idx"], 1);
        let frame = client.next_frame().await;
        assert_eq!(frame["event"], "test.list.add");
        assert_eq!(frame["data"], json!({"idx": 3, "value": "F"}));
        client.assert_quiet().await;
    }

    #[tokio::test]
    async fn test_reset_unmatched_resource_is_not_reloaded() {
        let gw = Gateway::start();
        let mut client = gw.client();

        client.send(json!({"id": 1, "method": "subscribe.test.foo"}));
        gw.grant("test.foo").await;
        gw.respond("get.test.foo", json!({"result": {"model": {"a": 1}}}))
            .await;
        client.next_frame().await;

        gw.bus.publish("system.reset", r#"{"resources":["other.>"]}"#);
        client.sync().await;
        assert!(gw.bus.pending_requests().is_empty());

        // A change published after the reset is applied to the original model
        gw.bus.publish("event.test.foo.change", r#"{"values":{"a":2}}"#);
        assert_eq!(
            client.next_frame().await,
            json!({"event": "test.foo.change", "data": {"values": {"a": 2}}})
        );
    }

    // =============================================================================
    // FAN-OUT
    // =============================================================================

    #[tokio::test]
    async fn test_events_fan_out_in_order() {
        let gw = Gateway::start();
        let mut first = gw.client();
        let mut second = gw.client();

        first.send(json!({"id": 1, "method": "subscribe.test.counter"}));
        gw.grant("test.counter").await;
        gw.respond("get.test.counter", json!({"result": {"model": {"n": 0}}}))
            .await;
        first.next_frame().await;

        // Served from the cache
        second.send(json!({"id": 1, "method": "subscribe.test.counter"}));
        gw.grant("test.counter").await;
        assert_eq!(
            second.next_frame().await,
            json!({"id": 1, "result": {"models": {"test.counter": {"n": 0}}}})
        );
        assert_eq!(gw.bus.subscription_count("event.test.counter.*"), 1);

        for n in 1..=5 {
            gw.bus.publish(
                "event.test.counter.change",
                json!({"values": {"n": n}}).to_string(),
            );
        }
        for client in [&mut first, &mut second] {
            for n in 1..=5 {
                assert_eq!(
                    client.next_frame().await,
                    json!({"event": "test.counter.change", "data": {"values": {"n": n}}})
                );
            }
        }
    }

    #[tokio::test]
    async fn test_custom_event_is_forwarded() {
        let gw = Gateway::start();
        let mut client = gw.client();

        client.send(json!({"id": 1, "method": "subscribe.test.chat"}));
        gw.grant("test.chat").await;
        gw.respond("get.test.chat", json!({"result": {"model": {}}}))
            .await;
        client.next_frame().await;

        gw.bus
            .publish("event.test.chat.message", r#"{"text":"hello"}"#);
        assert_eq!(
            client.next_frame().await,
            json!({"event": "test.chat.message", "data": {"text": "hello"}})
        );
    }
}
