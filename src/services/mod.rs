pub mod consistency_checker;
pub mod content_generator;
pub mod idempotency;
pub mod json_repair;
pub mod language_merger;
pub mod llm_service;
pub mod prompt_builder;
pub mod retrieval;
pub mod review_writer;

pub use content_generator::{ContentGenerator, GenerationOutput, GenerationRequest};
pub use idempotency::{record_hash, subtask_input_hash, subtask_key, SubtaskKey};
pub use language_merger::WriteMode;
pub use llm_service::LlmService;
pub use retrieval::{ContextRetriever, ContextSnippet, HttpRetriever, NoopRetriever};
pub use review_writer::ReviewWriter;
