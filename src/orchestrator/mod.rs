//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责批处理任务的展开、调度和汇总，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `batch_processor` - 批处理任务编排器
//! - 展开批处理请求为子任务
//! - 控制并发数量（Semaphore）
//! - 取消、重试
//! - 汇总任务状态
//!
//! ### `key_registry` - 子任务键登记表
//! - 原子地检查并登记子任务键
//! - 记录每个键上次成功时的内容哈希
//!
//! ### `reports` - 只读查询
//! - 任务明细、一致性报表、错误统计、任务列表
//!
//! ## 层次关系
//!
//! ```text
//! batch_processor (处理 Vec<SubtaskItem>)
//!     ↓
//! workflow::SubtaskFlow (处理单个子任务)
//!     ↓
//! services (能力层：repair / merge / consistency / llm / retrieval)
//!     ↓
//! infrastructure (基础设施：QuestionStore)
//! ```
//!
//! ## 设计原则
//!
//! 1. **向下依赖**：编排层 → workflow → services → infrastructure
//! 2. **无业务逻辑**：只做调度和统计，不做具体的修复、合并判断

pub mod batch_processor;
pub mod key_registry;
pub mod reports;

// 重新导出主要类型
pub use batch_processor::TaskOrchestrator;
pub use key_registry::{Admission, KeyRegistry};
pub use reports::{ConsistencyFilter, ConsistencyReportRow, TaskDetail};
