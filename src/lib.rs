//! # Question Processing
//!
//! 多语言题库的 AI 批量处理服务：翻译、润色、补全缺失内容、生成分类标签
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有共享状态，只暴露能力
//! - `QuestionStore` - 题目、任务、子任务、一致性记录的存储；提供单题锁和原子提交
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，只处理单道题
//! - `json_repair` - 修复 AI 返回的不规范 JSON
//! - `language_merger` - 按语言合并多语言字段
//! - `consistency_checker` - 判断题答案与解析的一致性检查
//! - `LlmService` / `HttpRetriever` - 内容生成与检索增强
//! - `ReviewWriter` - 写待复核记录
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个子任务"的完整处理流程
//! - `SubtaskCtx` - 上下文封装（task_id + 题目 + 操作 + 语言）
//! - `SubtaskFlow` - 流程编排（prepare → invoke → repair → merge → consistency → persist）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/batch_processor` - 任务展开、并发控制、取消与重试
//! - `orchestrator/reports` - 任务明细、一致性报表、错误统计
//!
//! ## 模块结构

pub mod app;
pub mod config;
pub mod error;
pub mod infrastructure;

pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use app::App;
pub use config::Config;
pub use error::{AppError, AppResult, ErrorStage, ProviderError};
pub use infrastructure::{InMemoryStore, QuestionStore};
pub use models::{
    BatchRequest, BatchTask, ConsistencyStatus, Operation, Page, PageRequest, QuestionRecord,
    QuestionType, SkipReason, SubtaskItem, SubtaskStatus, TaskStatus,
};
pub use orchestrator::{ConsistencyFilter, ConsistencyReportRow, TaskDetail, TaskOrchestrator};
pub use services::{ContentGenerator, ContextRetriever, GenerationOutput, GenerationRequest};
pub use workflow::{SubtaskCtx, SubtaskFlow};
