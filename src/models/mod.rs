pub mod consistency;
pub mod loaders;
pub mod payload;
pub mod question;
pub mod subtask;
pub mod task;

pub use consistency::{ConsistencyEntry, ConsistencyRecord, ConsistencyStatus, TruthValue};
pub use loaders::{load_all_toml_files, load_toml_records};
pub use payload::{LocalizedPayload, ProcessedPayload, TagsPayload};
pub use question::{
    LocalizedField, LocalizedOptions, LocalizedText, QuestionRecord, QuestionType, SourceFields,
    StageTag,
};
pub use subtask::{SkipReason, SubtaskError, SubtaskItem, SubtaskStatus, TokenUsage};
pub use task::{
    is_valid_language_code, BatchRequest, BatchTask, Operation, Page, PageRequest, RecordSummary,
    StatusCounts, SubtaskSpec, TaskStatus,
};
