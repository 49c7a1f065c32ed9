//! Cached policy-topic answers.
//!
//! Refund, shipping and order policy questions are answered from a
//! composed guide keyed by topic alias, never by the LLM. The composed
//! text is cached so operators can replace it in the cache without a
//! deploy; a miss recomposes the built-in guide.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use shelf_core::cache::{get_json, set_json, Cache};
use shelf_core::metrics::Metrics;
use shelf_core::models::{Reply, Source};
use shelf_core::reason;

use super::{ToolContext, ToolOutcome, ToolRouter};

const TOPIC_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyTopic {
    pub alias: String,
    pub title: String,
    pub snippet: String,
    pub body: String,
}

fn builtin(alias: &str) -> Option<PolicyTopic> {
    let (title, snippet, body) = match alias {
        "commerce-refund-guide" => (
            "환불 안내",
            "상품 수령 후 7일 이내 환불을 신청할 수 있습니다.",
            "상품 수령 후 7일 이내에 주문 내역에서 환불을 신청할 수 있습니다. \
             단순 변심의 경우 왕복 배송비가 차감되며, 파손·오배송은 전액 환불됩니다. \
             전자책과 개봉한 음반은 환불이 제한됩니다.",
        ),
        "commerce-shipping-guide" => (
            "배송 안내",
            "결제 완료 후 평균 1~2영업일 내 출고됩니다.",
            "결제 완료 후 평균 1~2영업일 내에 출고되며, 도서산간 지역은 2~3일이 더 걸릴 수 있습니다. \
             15,000원 이상 주문 시 기본 배송비가 무료입니다.",
        ),
        "commerce-order-guide" => (
            "주문 안내",
            "출고 전 주문은 주문 내역에서 직접 취소할 수 있습니다.",
            "출고 전 주문은 주문 내역에서 직접 취소할 수 있으며, 출고 후에는 반품 절차를 따릅니다. \
             여러 권을 주문한 경우 일부 상품만 취소할 수도 있습니다.",
        ),
        _ => return None,
    };
    Some(PolicyTopic {
        alias: alias.to_string(),
        title: title.to_string(),
        snippet: snippet.to_string(),
        body: body.to_string(),
    })
}

fn cache_key(alias: &str) -> String {
    format!("policy:topic:{}", alias)
}

#[derive(Clone)]
pub struct PolicyTopics {
    cache: Arc<dyn Cache>,
    metrics: Arc<Metrics>,
}

impl PolicyTopics {
    pub fn new(cache: Arc<dyn Cache>, metrics: Arc<Metrics>) -> Self {
        Self { cache, metrics }
    }

    pub async fn get(&self, alias: &str) -> Option<PolicyTopic> {
        let key = cache_key(alias);
        match get_json::<PolicyTopic>(self.cache.as_ref(), &key).await {
            Ok(Some(topic)) => {
                self.metrics
                    .inc("chat_policy_topic_cache_total", &[("result", "hit")]);
                return Some(topic);
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(alias, error = %err, "policy topic cache unreadable"),
        }
        self.metrics
            .inc("chat_policy_topic_cache_total", &[("result", "miss")]);
        let topic = builtin(alias)?;
        if let Err(err) = set_json(self.cache.as_ref(), &key, &topic, Some(TOPIC_TTL)).await {
            tracing::warn!(alias, error = %err, "failed to cache policy topic");
        }
        Some(topic)
    }
}

pub async fn answer(router: &ToolRouter, ctx: &ToolContext<'_>) -> ToolOutcome {
    let topic = match ctx.understanding.intent.policy_topic_alias() {
        Some(alias) => router.topics.get(alias).await,
        None => None,
    };
    let Some(topic) = topic else {
        return ToolOutcome::reply(Reply::new(
            reason::MISSING_REQUIRED_INFO,
            "어떤 정책이 궁금하신지 알려 주세요.",
        ));
    };
    let source = Source::new(format!("POLICY / {}", topic.alias), topic.title.clone())
        .with_snippet(topic.snippet.clone());
    ToolOutcome::reply(Reply::ok(topic.body).with_sources(vec![source]))
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::config::ToolsConfig;
    use shelf_core::cache::memory::InMemoryCache;

    #[tokio::test]
    async fn test_refund_question_served_from_topic() {
        let router = router("http://127.0.0.1:9", "http://127.0.0.1:9", ToolsConfig::default());
        let turn = Turn::new("환불 가능한가요?", None, session("s1"));
        let outcome = router.route(&turn.ctx()).await.unwrap();
        assert_eq!(outcome.reply.reason_code, reason::OK);
        assert_eq!(outcome.reply.citations, vec!["POLICY / commerce-refund-guide"]);
        assert!(outcome.reply.content.contains("7일"));
    }

    #[tokio::test]
    async fn test_cached_topic_wins_over_builtin() {
        let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::new());
        let metrics = Arc::new(Metrics::new());
        let custom = PolicyTopic {
            alias: "commerce-shipping-guide".into(),
            title: "배송".into(),
            snippet: "당일 출고".into(),
            body: "오후 2시 이전 주문은 당일 출고됩니다.".into(),
        };
        set_json(cache.as_ref(), &cache_key(&custom.alias), &custom, None)
            .await
            .unwrap();
        let topics = PolicyTopics::new(cache, metrics.clone());
        assert_eq!(topics.get("commerce-shipping-guide").await, Some(custom));
        assert_eq!(
            metrics.counter("chat_policy_topic_cache_total", &[("result", "hit")]),
            1.0
        );
        assert!(topics.get("no-such-guide").await.is_none());
    }
}
