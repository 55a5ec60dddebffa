//! Retrieval store: chunking, embeddings, vector index and fallback.

mod chunker;
mod concepts;
mod embeddings;
mod store;
mod vector;

pub use chunker::{DEFAULT_CHUNK_SIZE, chunk_text};
pub use concepts::{ConceptHit, ConceptIndex};
pub use embeddings::{
    EmbeddingError, EmbeddingProvider, MockEmbeddings, OpenAiEmbeddings, cosine_similarity,
};
pub use store::{
    ASK_TOP_K, AskResult, AskSource, ExportedContent, FALLBACK_SCORE, FallbackRetrieval,
    ResilientRetrieval, RetrievalService, SearchHit, VectorRetrieval, chunk_id,
    distance_to_score, partition_name, partition_tenant,
};
pub use vector::{ChunkRecord, InMemoryVectorIndex, PgVectorIndex, VectorIndex};
