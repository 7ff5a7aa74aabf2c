pub mod knowledge;
pub mod personality;

pub use knowledge::{
    KnowledgeChunk, KnowledgeProvider, KnowledgeQuery, NoopKnowledgeProvider,
    StaticKnowledgeProvider,
};
pub use personality::{
    ConsistencyScore, EnhancedContent, NoopPersonalityProvider, PersonalityProvider,
};
