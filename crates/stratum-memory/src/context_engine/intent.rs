//! Query intent classification
//!
//! Two interchangeable strategies behind one contract: a rule stage over
//! pattern tables and a model stage behind [`IntentProvider`]. The gated
//! classifier runs rules first and spends a model call only when the rule
//! confidence is below its floor.

use crate::providers::IntentProvider;
use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

/// Label the retrieval path tunes itself by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryIntent {
    /// The query is about the ongoing exchange; recent messages carry it.
    CurrentContext,
    /// The query refers back to earlier content of this conversation.
    PastReference,
    /// The query asks about a different conversation ("which chat was that
    /// in") and the caller should search across conversations.
    CrossConversation,
}

impl QueryIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryIntent::CurrentContext => "current_context",
            QueryIntent::PastReference => "past_reference",
            QueryIntent::CrossConversation => "cross_conversation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "current_context" => Some(QueryIntent::CurrentContext),
            "past_reference" => Some(QueryIntent::PastReference),
            "cross_conversation" => Some(QueryIntent::CrossConversation),
            _ => None,
        }
    }

    pub const LABELS: [&'static str; 3] =
        ["current_context", "past_reference", "cross_conversation"];
}

#[derive(Debug, Clone)]
pub struct IntentClassification {
    pub intent: QueryIntent,
    /// 0.0 - 1.0
    pub confidence: f32,
    /// Which stage produced the label.
    pub source: &'static str,
}

#[async_trait]
pub trait IntentStrategy: Send + Sync {
    async fn classify(&self, query: &str) -> anyhow::Result<IntentClassification>;
}

lazy_static! {
    static ref CROSS_CONVERSATION_PATTERNS: Vec<Regex> = [
        r"which (chat|conversation)",
        r"(another|a different|some other) (chat|conversation)",
        r"other (chats|conversations)",
        r"in (that|the) other (chat|conversation)",
        r"last time we (spoke|talked|chatted)",
        r"(find|search).*(conversation|chat)s?\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect();

    static ref PAST_REFERENCE_PATTERNS: Vec<Regex> = [
        r"\bearlier\b",
        r"\bbefore\b",
        r"\bpreviously\b",
        r"last time",
        r"\byesterday\b",
        r"we (discussed|talked about|decided|agreed)",
        r"(do you |)remember",
        r"\brecall\b",
        r"what (did|was) (we|you|i|said)",
        r"(mentioned|said) (earlier|before)",
        r"back (then|when)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect();
}

/// Rule stage: pattern tables with a match-count confidence score. Cheap and
/// always available.
#[derive(Default)]
pub struct RuleIntentStrategy;

impl RuleIntentStrategy {
    pub fn new() -> Self {
        Self
    }

    fn matches(patterns: &[Regex], query: &str) -> usize {
        patterns.iter().filter(|p| p.is_match(query)).count()
    }
}

#[async_trait]
impl IntentStrategy for RuleIntentStrategy {
    async fn classify(&self, query: &str) -> anyhow::Result<IntentClassification> {
        let query_lower = query.to_lowercase();
        let cross = Self::matches(&CROSS_CONVERSATION_PATTERNS, &query_lower);
        let past = Self::matches(&PAST_REFERENCE_PATTERNS, &query_lower);

        let (intent, confidence) = if cross > 0 {
            (
                QueryIntent::CrossConversation,
                (0.6 + 0.15 * cross as f32).min(0.95),
            )
        } else if past > 0 {
            (
                QueryIntent::PastReference,
                (0.6 + 0.15 * past as f32).min(0.95),
            )
        } else {
            // No backward-looking signal at all is itself a strong signal
            (QueryIntent::CurrentContext, 0.8)
        };

        Ok(IntentClassification {
            intent,
            confidence,
            source: "rules",
        })
    }
}

/// Model stage: one short completion choosing a label.
pub struct ModelIntentStrategy {
    provider: Arc<dyn IntentProvider>,
}

impl ModelIntentStrategy {
    pub fn new(provider: Arc<dyn IntentProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl IntentStrategy for ModelIntentStrategy {
    async fn classify(&self, query: &str) -> anyhow::Result<IntentClassification> {
        let label = self.provider.classify(query, &QueryIntent::LABELS).await?;
        let intent = QueryIntent::parse(&label)
            .ok_or_else(|| anyhow::anyhow!("Unknown intent label from model: {}", label))?;
        Ok(IntentClassification {
            intent,
            confidence: 0.9,
            source: "model",
        })
    }
}

/// Rules first; the model stage runs only below the confidence floor, and a
/// model failure falls back to the rule result.
pub struct GatedIntentClassifier {
    rules: RuleIntentStrategy,
    model: Option<ModelIntentStrategy>,
    confidence_floor: f32,
}

impl GatedIntentClassifier {
    pub fn new(model: Option<ModelIntentStrategy>, confidence_floor: f32) -> Self {
        Self {
            rules: RuleIntentStrategy::new(),
            model,
            confidence_floor,
        }
    }

    pub fn rules_only() -> Self {
        Self::new(None, 0.75)
    }

    pub async fn classify(&self, query: &str) -> IntentClassification {
        // The rule stage is infallible
        let rule_result = self
            .rules
            .classify(query)
            .await
            .unwrap_or(IntentClassification {
                intent: QueryIntent::CurrentContext,
                confidence: 0.0,
                source: "rules",
            });

        if rule_result.confidence >= self.confidence_floor {
            return rule_result;
        }

        if let Some(ref model) = self.model {
            match model.classify(query).await {
                Ok(model_result) => {
                    debug!(
                        "Intent fallback to model: {} ({:.2}) over {} ({:.2})",
                        model_result.intent.as_str(),
                        model_result.confidence,
                        rule_result.intent.as_str(),
                        rule_result.confidence
                    );
                    return model_result;
                }
                Err(e) => {
                    warn!("Model intent classification failed, keeping rule result: {}", e);
                }
            }
        }
        rule_result
    }
}
