//! 批处理任务编排器 - 编排层
//!
//! ## 职责
//!
//! 1. **展开**：把批处理请求展开为子任务（题目 × 操作 × 目标语言），
//!    通过 [`KeyRegistry`] 原子地检查并登记子任务键
//! 2. **并发控制**：使用全局 Semaphore 限制同时执行的子任务数
//! 3. **进度汇总**：子任务结束后重新统计任务的计数与明细
//! 4. **取消 / 重试**：取消只影响尚未派发的子任务；重试是调用方的显式操作
//!
//! ## 设计特点
//!
//! - 提交立即返回任务 id，执行在后台进行
//! - 个别子任务失败不影响其他子任务，任务仍会到达 `completed`
//! - `failed` 只用于展开阶段的错误（如没有任何有效题目）

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{AppError, AppResult, ErrorStage, StoreError};
use crate::infrastructure::QuestionStore;
use crate::models::{
    is_valid_language_code, BatchRequest, BatchTask, ConsistencyStatus, RecordSummary, SkipReason,
    Operation, StatusCounts, SubtaskError, SubtaskItem, SubtaskSpec, SubtaskStatus, TaskStatus,
};
use crate::orchestrator::key_registry::{Admission, KeyRegistry};
use crate::services::content_generator::ContentGenerator;
use crate::services::retrieval::ContextRetriever;
use crate::services::{idempotency, subtask_key, ReviewWriter, SubtaskKey};
use crate::utils::logging;
use crate::workflow::{SubtaskCtx, SubtaskFlow};

/// 正在运行的任务的控制句柄
#[derive(Clone)]
struct TaskRun {
    /// 取消尚未派发的子任务
    cancel: CancellationToken,
    /// 任务结束时触发
    done: CancellationToken,
}

pub(crate) struct Inner {
    pub(crate) store: Arc<dyn QuestionStore>,
    flow: SubtaskFlow,
    registry: KeyRegistry,
    semaphore: Arc<Semaphore>,
    review_writer: Option<Arc<ReviewWriter>>,
    runs: Mutex<HashMap<String, TaskRun>>,
    /// 分离的后台写入任务
    background: TaskTracker,
    /// 串行化任务汇总的读-改-写
    task_update: Mutex<()>,
}

/// 批处理任务编排器
///
/// 可以廉价 clone，所有 clone 共享同一组资源。
#[derive(Clone)]
pub struct TaskOrchestrator {
    pub(crate) inner: Arc<Inner>,
}

impl TaskOrchestrator {
    /// 创建编排器
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn QuestionStore>,
        generator: Arc<dyn ContentGenerator>,
        retriever: Arc<dyn ContextRetriever>,
    ) -> Self {
        Self::build(config, store, generator, retriever, None)
    }

    /// 创建编排器，任务结束后把待复核记录写入文件
    pub fn with_review_writer(
        config: Arc<Config>,
        store: Arc<dyn QuestionStore>,
        generator: Arc<dyn ContentGenerator>,
        retriever: Arc<dyn ContextRetriever>,
        review_writer: ReviewWriter,
    ) -> Self {
        Self::build(config, store, generator, retriever, Some(Arc::new(review_writer)))
    }

    fn build(
        config: Arc<Config>,
        store: Arc<dyn QuestionStore>,
        generator: Arc<dyn ContentGenerator>,
        retriever: Arc<dyn ContextRetriever>,
        review_writer: Option<Arc<ReviewWriter>>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_subtasks));
        let flow = SubtaskFlow::new(generator, retriever, store.clone(), config);
        Self {
            inner: Arc::new(Inner {
                store,
                flow,
                registry: KeyRegistry::new(),
                semaphore,
                review_writer,
                runs: Mutex::new(HashMap::new()),
                background: TaskTracker::new(),
                task_update: Mutex::new(()),
            }),
        }
    }

    /// 提交批处理请求，立即返回任务 id
    ///
    /// 只有请求本身不合法时才返回错误；子任务的失败只体现在明细中。
    pub async fn submit(&self, request: BatchRequest) -> AppResult<String> {
        request.validate()?;

        let specs = request.expand();
        let mut task = BatchTask::new(
            Uuid::new_v4().to_string(),
            request.source_language.clone(),
            &specs,
        );
        task.record_ids = dedup(&request.record_ids);
        task.target_languages = request.effective_targets();

        self.start_task(task, specs).await
    }

    /// 直接提交一组子任务（用于重试）
    pub async fn submit_subtasks(
        &self,
        source_language: &str,
        specs: Vec<SubtaskSpec>,
    ) -> AppResult<String> {
        if !is_valid_language_code(source_language) {
            return Err(AppError::validation(format!(
                "source_language 不合法: '{}'",
                source_language
            )));
        }
        if specs.is_empty() {
            return Err(AppError::validation("子任务列表不能为空"));
        }
        if let Some(bad) = specs.iter().find(|s| {
            s.operation.is_per_language()
                != s.target_language.as_deref().is_some_and(is_valid_language_code)
        }) {
            return Err(AppError::validation(format!(
                "子任务 ({}, {}) 的目标语言不合法",
                bad.record_id, bad.operation
            )));
        }

        let specs = dedup(&specs);
        let task = BatchTask::new(Uuid::new_v4().to_string(), source_language.to_string(), &specs);
        self.start_task(task, specs).await
    }

    async fn start_task(&self, mut task: BatchTask, specs: Vec<SubtaskSpec>) -> AppResult<String> {
        let task_id = task.task_id.clone();
        let store = &self.inner.store;

        // ========== 展开 ==========
        let mut items = Vec::with_capacity(specs.len());
        let mut admitted = Vec::new();
        let mut valid_records = 0usize;
        let mut current_record = None;
        for spec in &specs {
            if current_record.as_ref().map(|(id, _)| *id) != Some(spec.record_id) {
                current_record = Some((spec.record_id, store.get_record(spec.record_id).await));
            }
            let record = match current_record.as_ref().map(|(_, r)| r) {
                Some(Ok(record)) => record,
                _ => {
                    items.push(SubtaskItem::rejected(
                        &task_id,
                        spec,
                        SubtaskError::new(
                            ErrorStage::Validation,
                            "record_not_found",
                            StoreError::RecordNotFound(spec.record_id).to_string(),
                        ),
                    ));
                    continue;
                }
            };
            valid_records += 1;

            let item = SubtaskItem::pending(&task_id, spec);
            let key = subtask_key(spec.record_id, spec.operation, spec.target_language.as_deref());
            let hash = idempotency::subtask_input_hash(
                record,
                spec.operation,
                &task.source_language,
                spec.target_language.as_deref(),
            );
            let item = match self.inner.registry.try_register(&key, &item.item_id, &hash).await {
                Admission::Admitted => {
                    admitted.push((key, item.item_id.clone()));
                    item
                }
                Admission::Unchanged => SubtaskItem::skipped(&task_id, spec, SkipReason::Unchanged),
                Admission::InFlight => SubtaskItem::skipped(&task_id, spec, SkipReason::InFlight),
            };
            items.push(item);
        }

        let pending: Vec<SubtaskItem> = items
            .iter()
            .filter(|i| i.status == SubtaskStatus::Pending)
            .cloned()
            .collect();
        let skipped = items
            .iter()
            .filter(|i| i.status == SubtaskStatus::Skipped)
            .count();

        task.counts = StatusCounts::from_statuses(items.iter().map(|i| i.status));
        task.details = summarize(&items);

        if let Err(e) = store.insert_items(items).await {
            self.release_admitted(&admitted).await;
            return Err(e.into());
        }

        if valid_records == 0 {
            warn!("[任务 {}] ❌ 没有任何有效的题目", task_id);
            task.status = TaskStatus::Failed;
            task.error = Some("没有任何有效的题目".to_string());
            task.finished_at = Some(Utc::now());
            store.save_task(task).await?;
            return Ok(task_id);
        }

        task.status = TaskStatus::Processing;
        task.started_at = Some(Utc::now());
        logging::log_task_submitted(&task_id, task.record_ids.len(), specs.len(), skipped);
        let source_language = task.source_language.clone();

        // 先登记运行句柄，任务一旦可见就能被取消
        let run = TaskRun {
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        };
        self.inner
            .runs
            .lock()
            .await
            .insert(task_id.clone(), run.clone());

        if let Err(e) = store.save_task(task).await {
            self.inner.runs.lock().await.remove(&task_id);
            self.release_admitted(&admitted).await;
            return Err(e.into());
        }

        let inner = self.inner.clone();
        let id = task_id.clone();
        tokio::spawn(async move {
            run_task(inner, id, source_language, pending, run).await;
        });

        Ok(task_id)
    }

    /// 任务未能启动时归还已登记的子任务键
    async fn release_admitted(&self, admitted: &[(SubtaskKey, String)]) {
        for (key, item_id) in admitted {
            self.inner.registry.release(key, item_id, None).await;
        }
    }

    /// 等待任务结束，返回最终状态
    pub async fn wait(&self, task_id: &str) -> AppResult<BatchTask> {
        let run = self.inner.runs.lock().await.get(task_id).cloned();
        if let Some(run) = run {
            run.done.cancelled().await;
        }
        Ok(self.inner.store.get_task(task_id).await?)
    }

    /// 取消任务：尚未派发的子任务被跳过，已派发的继续执行到结束
    pub async fn cancel(&self, task_id: &str) -> AppResult<()> {
        let task = self.inner.store.get_task(task_id).await?;
        if task.status.is_terminal() {
            return Err(AppError::validation(format!(
                "任务 {} 已结束 ({})，不能取消",
                task_id,
                task.status.as_str()
            )));
        }
        let run = self.inner.runs.lock().await.get(task_id).cloned();
        match run {
            Some(run) => {
                info!("[任务 {}] 🛑 收到取消请求", task_id);
                run.cancel.cancel();
                Ok(())
            }
            None => Err(StoreError::TaskNotFound(task_id.to_string()).into()),
        }
    }

    /// 等待所有分离的后台写入结束（进程退出前调用）
    pub async fn shutdown(&self) {
        self.inner.background.close();
        self.inner.background.wait().await;
    }

    /// 把已结束任务中失败的子任务作为新任务重新提交
    pub async fn retry_failed(&self, task_id: &str) -> AppResult<String> {
        let task = self.inner.store.get_task(task_id).await?;
        if !task.status.is_terminal() {
            return Err(AppError::validation(format!(
                "任务 {} 尚未结束，不能重试",
                task_id
            )));
        }
        let specs: Vec<SubtaskSpec> = self
            .inner
            .store
            .list_items(Some(task_id))
            .await
            .iter()
            .filter(|i| i.status == SubtaskStatus::Failed)
            .map(SubtaskItem::spec)
            .collect();
        if specs.is_empty() {
            return Err(AppError::validation(format!(
                "任务 {} 没有失败的子任务",
                task_id
            )));
        }
        info!("[任务 {}] 🔁 重试 {} 个失败的子任务", task_id, specs.len());
        self.submit_subtasks(&task.source_language, specs).await
    }
}

/// 后台派发任务的全部子任务
///
/// 子任务按批次派发：同一题目上改写源语言的操作各占一批，翻译排在它们之后，
/// 上一批全部结束后才派发下一批。
async fn run_task(
    inner: Arc<Inner>,
    task_id: String,
    source_language: String,
    pending: Vec<SubtaskItem>,
    run: TaskRun,
) {
    let mut undispatched = Vec::new();

    for wave in plan_waves(pending) {
        let mut handles = Vec::new();
        for item in wave {
            let permit = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => None,
                permit = inner.semaphore.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                undispatched.push(item);
                continue;
            };

            let worker = inner.clone();
            let ctx = SubtaskCtx::for_item(&item, &source_language);
            let key = subtask_key(item.record_id, item.operation, item.target_language.as_deref());
            let item_id = item.item_id.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                let outcome = worker.flow.run(item, &ctx).await;
                worker
                    .registry
                    .release(&key, &outcome.item.item_id, outcome.completed_hash.as_deref())
                    .await;
                refresh_task(&worker, &ctx.task_id).await;
                outcome
            });
            handles.push((item_id, handle));
        }

        let (item_ids, handles): (Vec<String>, Vec<_>) = handles.into_iter().unzip();
        for (item_id, result) in item_ids.into_iter().zip(join_all(handles).await) {
            if let Err(e) = result {
                error!("[任务 {}] 子任务 {} 执行异常: {}", task_id, item_id, e);
                abandon_item(&inner, &item_id).await;
            }
        }
    }

    for mut item in undispatched {
        let key = subtask_key(item.record_id, item.operation, item.target_language.as_deref());
        if let Err(e) = item.skip(SkipReason::Cancelled) {
            error!("[任务 {}] {}", task_id, e);
        } else if let Err(e) = inner.store.update_item(item.clone()).await {
            error!("[任务 {}] 无法保存取消状态: {}", task_id, e);
        }
        inner.registry.release(&key, &item.item_id, None).await;
    }

    finish_task(&inner, &task_id, run.cancel.is_cancelled()).await;
    run.done.cancel();
    inner.runs.lock().await.remove(&task_id);
}

/// 把待执行的子任务分成按顺序派发的批次
///
/// 同一题目内：补全 < 润色 < 全流程，每个改写源语言的子任务独占一批；
/// 翻译在这些子任务全部结束后执行；分类标签不依赖源语言，放在第一批。
/// 不同题目互不影响，同一批内的子任务并发执行。
fn plan_waves(pending: Vec<SubtaskItem>) -> Vec<Vec<SubtaskItem>> {
    let mut order = Vec::new();
    let mut by_record: HashMap<u64, Vec<SubtaskItem>> = HashMap::new();
    for item in pending {
        by_record
            .entry(item.record_id)
            .or_insert_with(|| {
                order.push(item.record_id);
                Vec::new()
            })
            .push(item);
    }

    let mut waves: Vec<Vec<SubtaskItem>> = Vec::new();
    for record_id in order {
        let Some(items) = by_record.remove(&record_id) else {
            continue;
        };
        let (mut writers, others): (Vec<_>, Vec<_>) =
            items.into_iter().partition(|i| i.operation.rewrites_source());
        writers.sort_by_key(|i| i.operation.source_rank());
        let after_writers = writers.len();

        let placed = writers.into_iter().enumerate().chain(others.into_iter().map(|item| {
            let wave = match item.operation {
                Operation::Translate => after_writers,
                _ => 0,
            };
            (wave, item)
        }));
        for (wave, item) in placed {
            if waves.len() <= wave {
                waves.resize_with(wave + 1, Vec::new);
            }
            waves[wave].push(item);
        }
    }
    waves
}

/// 子任务异常退出时标记为失败并释放键
async fn abandon_item(inner: &Inner, item_id: &str) {
    let Ok(mut item) = inner.store.get_item(item_id).await else {
        return;
    };
    let key = subtask_key(item.record_id, item.operation, item.target_language.as_deref());
    if item.status == SubtaskStatus::Processing {
        let failure = SubtaskError::new(ErrorStage::Persist, "worker_panicked", "子任务执行异常退出");
        if item.fail(failure).is_ok() {
            if let Err(e) = inner.store.commit_subtask(item.clone(), None, None).await {
                error!("无法保存子任务 {} 的失败状态: {}", item_id, e);
            }
        }
    }
    inner.registry.release(&key, item_id, None).await;
}

/// 重新统计任务的计数与明细
async fn refresh_task(inner: &Inner, task_id: &str) {
    let _lock = inner.task_update.lock().await;
    let Ok(mut task) = inner.store.get_task(task_id).await else {
        return;
    };
    if task.status.is_terminal() {
        return;
    }
    let items = inner.store.list_items(Some(task_id)).await;
    task.counts = StatusCounts::from_statuses(items.iter().map(|i| i.status));
    task.details = summarize(&items);
    if let Err(e) = inner.store.save_task(task).await {
        warn!("[任务 {}] 无法更新进度: {}", task_id, e);
    }
}

async fn finish_task(inner: &Inner, task_id: &str, cancelled: bool) {
    let items = {
        let _lock = inner.task_update.lock().await;
        let mut task = match inner.store.get_task(task_id).await {
            Ok(task) => task,
            Err(e) => {
                error!("[任务 {}] {}", task_id, e);
                return;
            }
        };
        let items = inner.store.list_items(Some(task_id)).await;
        task.counts = StatusCounts::from_statuses(items.iter().map(|i| i.status));
        task.details = summarize(&items);
        task.status = if cancelled {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Completed
        };
        task.finished_at = Some(Utc::now());
        logging::log_task_complete(task_id, task.status, &task.counts);
        if let Err(e) = inner.store.save_task(task).await {
            error!("[任务 {}] 无法保存最终状态: {}", task_id, e);
        }
        items
    };

    spawn_review(inner, task_id, items).await;
}

/// 分离任务：写入待复核记录，出错只记录日志
async fn spawn_review(inner: &Inner, task_id: &str, items: Vec<SubtaskItem>) {
    let Some(writer) = inner.review_writer.clone() else {
        return;
    };
    let failed: Vec<SubtaskItem> = items
        .into_iter()
        .filter(|i| i.status == SubtaskStatus::Failed)
        .collect();
    let inconsistent: Vec<_> = inner
        .store
        .list_consistency()
        .await
        .into_iter()
        .filter(|c| c.task_id == task_id && c.entry.status == ConsistencyStatus::Inconsistent)
        .collect();

    let task_id = task_id.to_string();
    inner.background.spawn(async move {
        match writer.write_task(&task_id, &failed, &inconsistent).await {
            Ok(0) => {}
            Ok(lines) => info!(
                "[任务 {}] 📝 {} 条待复核记录已写入 {}",
                task_id,
                lines,
                writer.path()
            ),
            Err(e) => warn!("[任务 {}] ⚠️ 写入待复核记录失败: {:#}", task_id, e),
        }
    });
}

/// 按题目汇总子任务状态，保持题目首次出现的顺序
fn summarize(items: &[SubtaskItem]) -> Vec<RecordSummary> {
    let mut order = Vec::new();
    let mut by_record: BTreeMap<u64, RecordSummary> = BTreeMap::new();
    for item in items {
        let summary = by_record.entry(item.record_id).or_insert_with(|| {
            order.push(item.record_id);
            RecordSummary {
                record_id: item.record_id,
                operations: Vec::new(),
                counts: StatusCounts::default(),
            }
        });
        if !summary.operations.contains(&item.operation) {
            summary.operations.push(item.operation);
        }
        summary.counts.record(item.status);
    }
    order
        .into_iter()
        .filter_map(|id| by_record.remove(&id))
        .collect()
}

fn dedup<T: Clone + PartialEq>(values: &[T]) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(values.len());
    for value in values {
        if !out.contains(value) {
            out.push(value.clone());
        }
    }
    out
}
