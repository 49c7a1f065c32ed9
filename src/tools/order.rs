//! Order, shipment and refund lookups.

use serde_json::Value;

use shelf_core::models::{Intent, Reply, Source, SLOT_ORDER_REF};
use shelf_core::reason;

use crate::commerce::{field_str, unwrap_envelope};

use super::{ToolContext, ToolOutcome, ToolRouter};

fn describe_order(order_ref: &str, order: &Value) -> String {
    let status = field_str(order, "status").unwrap_or_else(|| "확인 중".to_string());
    let mut text = format!("주문 {}의 현재 상태는 '{}'입니다.", order_ref, status);
    if let Some(total) = field_str(order, "total_amount") {
        text.push_str(&format!(" 결제 금액: {}원.", total));
    }
    if let Some(created) = field_str(order, "created_at") {
        text.push_str(&format!(" 주문일: {}.", created));
    }
    text
}

fn describe_shipment(order_ref: &str, shipment: &Value) -> String {
    let status = field_str(shipment, "status").unwrap_or_else(|| "확인 중".to_string());
    let mut text = format!("주문 {}의 배송 상태는 '{}'입니다.", order_ref, status);
    if let Some(carrier) = field_str(shipment, "carrier") {
        text.push_str(&format!(" 택배사: {}.", carrier));
    }
    if let Some(tracking) = field_str(shipment, "tracking_number") {
        text.push_str(&format!(" 송장번호: {}.", tracking));
    }
    text
}

fn describe_refund(order_ref: &str, refund: &Value) -> String {
    let status = field_str(refund, "status").unwrap_or_else(|| "확인 중".to_string());
    let mut text = format!("주문 {}의 환불 상태는 '{}'입니다.", order_ref, status);
    if let Some(amount) = field_str(refund, "amount") {
        text.push_str(&format!(" 환불 금액: {}원.", amount));
    }
    text
}

pub async fn lookup(router: &ToolRouter, ctx: &ToolContext<'_>) -> ToolOutcome {
    let Some(order_ref) = ctx.understanding.slot(SLOT_ORDER_REF) else {
        return ToolOutcome::reply(Reply::new(
            &reason::need_slot(SLOT_ORDER_REF),
            "주문번호를 알려 주세요. 예: 주문 12",
        ));
    };
    let call = ctx.call_context();
    let intent = ctx.understanding.intent;

    let (tool, result) = match intent {
        Intent::ShipmentLookup => (
            "shipment_lookup",
            router
                .call("shipment_lookup", router.commerce.shipment_by_order(order_ref, &call))
                .await,
        ),
        Intent::RefundLookup => (
            "refund_lookup",
            router
                .call("refund_lookup", router.commerce.refund_by_order(order_ref, &call))
                .await,
        ),
        _ => (
            "order_lookup",
            router
                .call("order_lookup", router.commerce.get_order(order_ref, &call))
                .await,
        ),
    };

    let body = match result {
        Ok(body) => body,
        Err(failure) => {
            tracing::info!(
                tool,
                order_ref,
                reason = failure.reason_code(),
                trace_id = ctx.trace_id,
                "order lookup failed"
            );
            return router.failure_outcome(ctx, tool, &failure);
        }
    };

    let (content, citation, title, payload) = match intent {
        Intent::ShipmentLookup => {
            let shipment = unwrap_envelope(&body, "shipment");
            (
                describe_shipment(order_ref, shipment),
                format!("COMMERCE / shipments/by-order/{}", order_ref),
                "배송 정보",
                shipment,
            )
        }
        Intent::RefundLookup => {
            let refund = unwrap_envelope(&body, "refund");
            (
                describe_refund(order_ref, refund),
                format!("COMMERCE / refunds/by-order/{}", order_ref),
                "환불 정보",
                refund,
            )
        }
        _ => {
            let order = unwrap_envelope(&body, "order");
            (
                describe_order(order_ref, order),
                format!("COMMERCE / orders/{}", order_ref),
                "주문 정보",
                order,
            )
        }
    };
    let snippet = field_str(payload, "status").unwrap_or_default();
    let source = Source::new(citation, title).with_snippet(snippet);
    ToolOutcome::succeeded(Reply::ok(content).with_sources(vec![source]))
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::config::ToolsConfig;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_order_lookup_carries_tool_citation() {
        let commerce = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orders/12"))
            .and(header("x-user-id", "1"))
            .and(header("x-tenant-id", "books"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "order": {"order_id": 12, "status": "PAID", "total_amount": 15000}
            })))
            .mount(&commerce)
            .await;

        let router = router(&commerce.uri(), "http://127.0.0.1:9", ToolsConfig::default());
        let turn = Turn::new("주문 12 상태 알려줘", Some("1"), session("s1"));
        let outcome = router.route(&turn.ctx()).await.unwrap();
        assert_eq!(outcome.reply.reason_code, reason::OK);
        assert!(outcome.reply.content.contains("PAID"));
        assert_eq!(outcome.reply.citations, vec!["COMMERCE / orders/12"]);
        assert!(outcome.tool_succeeded);
    }

    #[tokio::test]
    async fn test_not_found_and_forbidden() {
        let commerce = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orders/404"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": {"code": "not_found", "message": "no"}})))
            .mount(&commerce)
            .await;
        Mock::given(method("GET"))
            .and(path("/shipments/by-order/7"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({"error": {"code": "forbidden", "message": "no"}})))
            .mount(&commerce)
            .await;

        let router = router(&commerce.uri(), "http://127.0.0.1:9", ToolsConfig::default());
        let turn = Turn::new("주문 404 상태 알려줘", Some("1"), session("s1"));
        let outcome = router.route(&turn.ctx()).await.unwrap();
        assert_eq!(outcome.reply.reason_code, reason::RESOURCE_NOT_FOUND);

        let turn = Turn::new("주문 7 배송 어디쯤이야", Some("1"), session("s1"));
        let outcome = router.route(&turn.ctx()).await.unwrap();
        assert_eq!(outcome.reply.reason_code, reason::AUTH_FORBIDDEN);
    }

    #[tokio::test]
    async fn test_timeouts_open_the_circuit() {
        let commerce = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/orders/12"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&commerce)
            .await;

        let tools = ToolsConfig {
            tool_lookup_retry: 0,
            tool_circuit_fail_threshold: 1,
            ..Default::default()
        };
        let router = router(&commerce.uri(), "http://127.0.0.1:9", tools);
        let turn = Turn::new("주문 12 상태 알려줘", Some("1"), session("s1"));

        let first = router.route(&turn.ctx()).await.unwrap();
        assert_eq!(first.reply.reason_code, reason::TOOL_TIMEOUT);

        let second = router.route(&turn.ctx()).await.unwrap();
        assert_eq!(second.reply.reason_code, reason::TOOL_CIRCUIT_OPEN);
        assert!(second.reply.retry_after_ms.is_some());
        assert_eq!(second.audits.len(), 1);
        assert_eq!(second.audits[0].reason_code, reason::TOOL_CIRCUIT_OPEN);
    }
}
