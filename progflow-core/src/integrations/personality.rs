use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnhancedContent {
    pub enhanced_content: String,
    pub confidence_score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsistencyScore {
    pub overall_score: f32,
    pub is_consistent: bool,
}

/// Adapts outgoing content to a tenant's configured persona.
#[async_trait]
pub trait PersonalityProvider: Send + Sync {
    async fn enhance(
        &self,
        base_content: &str,
        tenant_id: &str,
        context: &Value,
    ) -> Result<EnhancedContent>;

    async fn score_consistency(&self, response: &str, tenant_id: &str) -> Result<ConsistencyScore>;
}

/// Returns content unchanged and reports everything as consistent.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPersonalityProvider;

#[async_trait]
impl PersonalityProvider for NoopPersonalityProvider {
    async fn enhance(
        &self,
        base_content: &str,
        _tenant_id: &str,
        _context: &Value,
    ) -> Result<EnhancedContent> {
        Ok(EnhancedContent {
            enhanced_content: base_content.to_owned(),
            confidence_score: 1.0,
        })
    }

    async fn score_consistency(
        &self,
        _response: &str,
        _tenant_id: &str,
    ) -> Result<ConsistencyScore> {
        Ok(ConsistencyScore {
            overall_score: 1.0,
            is_consistent: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn noop_is_identity_and_always_consistent() {
        let provider = NoopPersonalityProvider;
        let enhanced = provider.enhance("Hello", "t", &json!({})).await.unwrap();
        assert_eq!(enhanced.enhanced_content, "Hello");

        let score = provider.score_consistency("Hello", "t").await.unwrap();
        assert!(score.is_consistent);
    }
}
