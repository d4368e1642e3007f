pub mod subtask_ctx;
pub mod subtask_flow;

pub use subtask_ctx::SubtaskCtx;
pub use subtask_flow::{SubtaskFlow, SubtaskOutcome};
