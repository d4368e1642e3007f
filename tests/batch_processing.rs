use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use question_processing::error::{ErrorStage, StoreError};
use question_processing::models::{
    is_valid_language_code, ConsistencyRecord, StageTag, SubtaskSpec, TruthValue,
};
use question_processing::services::{
    ContentGenerator, ContextRetriever, ContextSnippet, GenerationOutput, GenerationRequest,
    NoopRetriever, ReviewWriter,
};
use question_processing::{
    AppError, BatchRequest, Config, ConsistencyFilter, ConsistencyStatus, InMemoryStore,
    Operation, PageRequest, ProviderError, QuestionRecord, QuestionStore, QuestionType,
    BatchTask, SkipReason, SubtaskItem, SubtaskStatus, TaskOrchestrator, TaskStatus,
};
use tokio::sync::OwnedMutexGuard;

type Script = Box<dyn Fn(&GenerationRequest, usize) -> Result<String, ProviderError> + Send + Sync>;

/// 按脚本返回响应的内容生成服务，记录每个 (题目, 操作, 语言) 的调用次数
struct ScriptedGenerator {
    script: Script,
    delay: Duration,
    calls: Mutex<HashMap<(u64, Operation, Option<String>), usize>>,
}

impl ScriptedGenerator {
    fn new(
        script: impl Fn(&GenerationRequest, usize) -> Result<String, ProviderError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            delay: Duration::ZERO,
            calls: Mutex::new(HashMap::new()),
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }
}

#[async_trait]
impl ContentGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, ProviderError> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls
                .entry((
                    request.record_id,
                    request.operation,
                    request.target_language.clone(),
                ))
                .or_insert(0);
            *count += 1;
            *count - 1
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.script)(request, attempt).map(|raw_text| GenerationOutput {
            raw_text,
            usage: None,
            model: "scripted".to_string(),
        })
    }
}

/// 总是失败的检索服务
struct BrokenRetriever;

#[async_trait]
impl ContextRetriever for BrokenRetriever {
    async fn retrieve(
        &self,
        _query: &str,
        _top_k: usize,
        _threshold: f32,
    ) -> Result<Vec<ContextSnippet>, ProviderError> {
        Err(ProviderError::Transport {
            message: "connection refused".to_string(),
        })
    }
}

/// 包装内存存储：记录每个子任务经历的状态，并可注入写入故障
#[derive(Default)]
struct RecordingStore {
    inner: InMemoryStore,
    history: Mutex<HashMap<String, Vec<SubtaskStatus>>>,
    fail_next_insert: AtomicBool,
    slow_processing_save: AtomicBool,
}

impl RecordingStore {
    fn with_records(records: Vec<QuestionRecord>) -> Self {
        Self {
            inner: InMemoryStore::with_records(records),
            ..Self::default()
        }
    }

    fn record_status(&self, item: &SubtaskItem) {
        self.history
            .lock()
            .unwrap()
            .entry(item.item_id.clone())
            .or_default()
            .push(item.status);
    }

    fn history(&self) -> HashMap<String, Vec<SubtaskStatus>> {
        self.history.lock().unwrap().clone()
    }
}

#[async_trait]
impl QuestionStore for RecordingStore {
    async fn get_record(&self, id: u64) -> Result<QuestionRecord, StoreError> {
        self.inner.get_record(id).await
    }

    async fn put_record(&self, record: QuestionRecord) -> Result<(), StoreError> {
        self.inner.put_record(record).await
    }

    async fn lock_record(&self, id: u64) -> OwnedMutexGuard<()> {
        self.inner.lock_record(id).await
    }

    async fn save_task(&self, task: BatchTask) -> Result<(), StoreError> {
        let processing = task.status == TaskStatus::Processing;
        self.inner.save_task(task).await?;
        if processing && self.slow_processing_save.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<BatchTask, StoreError> {
        self.inner.get_task(task_id).await
    }

    async fn list_tasks(&self) -> Vec<BatchTask> {
        self.inner.list_tasks().await
    }

    async fn insert_items(&self, items: Vec<SubtaskItem>) -> Result<(), StoreError> {
        if self.fail_next_insert.swap(false, Ordering::SeqCst) {
            return Err(StoreError::WriteFailed("disk full".to_string()));
        }
        for item in &items {
            self.record_status(item);
        }
        self.inner.insert_items(items).await
    }

    async fn update_item(&self, item: SubtaskItem) -> Result<(), StoreError> {
        self.record_status(&item);
        self.inner.update_item(item).await
    }

    async fn get_item(&self, item_id: &str) -> Result<SubtaskItem, StoreError> {
        self.inner.get_item(item_id).await
    }

    async fn list_items(&self, task_id: Option<&str>) -> Vec<SubtaskItem> {
        self.inner.list_items(task_id).await
    }

    async fn commit_subtask(
        &self,
        item: SubtaskItem,
        record: Option<QuestionRecord>,
        consistency: Option<ConsistencyRecord>,
    ) -> Result<(), StoreError> {
        self.record_status(&item);
        self.inner.commit_subtask(item, record, consistency).await
    }

    async fn list_consistency(&self) -> Vec<ConsistencyRecord> {
        self.inner.list_consistency().await
    }
}

fn config(max_concurrent: usize, timeout_secs: u64) -> Arc<Config> {
    Arc::new(Config {
        max_concurrent_subtasks: max_concurrent,
        request_timeout_secs: timeout_secs,
        retrieval_top_k: 0,
        ..Config::default()
    })
}

fn single_choice(id: u64) -> QuestionRecord {
    QuestionRecord::new(id, QuestionType::Single)
        .with_content("zh", &format!("第 {} 题：机动车遇到黄灯应当？", id))
        .with_options("zh", &["加速通过", "停车等待"])
        .with_explanation("zh", "黄灯亮时应当停车等待。")
        .with_content("en", "Original English")
        .with_answer("B")
}

fn true_false(id: u64, answer: &str) -> QuestionRecord {
    QuestionRecord::new(id, QuestionType::TrueFalse)
        .with_content("zh", "红灯时可以右转。")
        .with_explanation("zh", "该说法是错误的。")
        .with_answer(answer)
}

fn translate_request(record_ids: Vec<u64>, targets: &[&str]) -> BatchRequest {
    BatchRequest {
        record_ids,
        operations: vec![Operation::Translate],
        source_language: "zh".to_string(),
        target_languages: targets.iter().map(|t| t.to_string()).collect(),
    }
}

fn ja_translation(request: &GenerationRequest) -> String {
    format!(
        r#"{{"content": "問題{}", "options": ["加速する", "停止する"], "explanation": "停止します。"}}"#,
        request.record_id
    )
}

fn setup(
    records: Vec<QuestionRecord>,
    generator: Arc<ScriptedGenerator>,
    config: Arc<Config>,
) -> (TaskOrchestrator, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::with_records(records));
    let orchestrator =
        TaskOrchestrator::new(config, store.clone(), generator, Arc::new(NoopRetriever));
    (orchestrator, store)
}

#[tokio::test]
async fn test_translate_writes_only_target_language() {
    let generator = Arc::new(ScriptedGenerator::new(|req, _| Ok(ja_translation(req))));
    let records: Vec<_> = (1..=3).map(single_choice).collect();
    let (orchestrator, store) = setup(records, generator.clone(), config(2, 10));

    let task_id = orchestrator
        .submit(translate_request(vec![1, 2, 3], &["ja"]))
        .await
        .unwrap();
    let task = orchestrator.wait(&task_id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.counts.succeeded, 3);
    assert_eq!(task.details.len(), 3);
    assert_eq!(generator.total_calls(), 3);

    for id in 1..=3 {
        let record = store.get_record(id).await.unwrap();
        assert_eq!(record.content_in("ja"), Some(format!("問題{}", id).as_str()));
        assert_eq!(record.options_in("ja").unwrap().len(), 2);
        assert_eq!(record.explanation_in("ja"), Some("停止します。"));
        assert_eq!(record.content_in("en"), Some("Original English"));
        assert!(record.content_in("zh").is_some());
        assert!(!record.content_hash.is_empty());
    }

    let items = store.list_items(Some(&task_id)).await;
    assert!(items.iter().all(|i| i.ai_request.is_some() && i.processed_data.is_some()));
}

#[tokio::test]
async fn test_unrequested_languages_in_response_are_dropped() {
    let generator = Arc::new(ScriptedGenerator::new(|_, _| {
        Ok(r#"{"content": {"ja": "日本語の問題", "en": "Overwritten"}}"#.to_string())
    }));
    let (orchestrator, store) = setup(vec![single_choice(1)], generator, config(1, 10));

    let task_id = orchestrator
        .submit(translate_request(vec![1], &["ja"]))
        .await
        .unwrap();
    orchestrator.wait(&task_id).await.unwrap();

    let record = store.get_record(1).await.unwrap();
    assert_eq!(record.content_in("ja"), Some("日本語の問題"));
    assert_eq!(record.content_in("en"), Some("Original English"));
}

#[tokio::test]
async fn test_fenced_response_with_trailing_comma_is_repaired() {
    let generator = Arc::new(ScriptedGenerator::new(|_, _| {
        Ok("好的，结果如下：\n```json\n{\"content\": \"修復済み\", \"explanation\": \"説明\",}\n```".to_string())
    }));
    let (orchestrator, store) = setup(vec![single_choice(1)], generator, config(1, 10));

    let task_id = orchestrator
        .submit(translate_request(vec![1], &["ja"]))
        .await
        .unwrap();
    let task = orchestrator.wait(&task_id).await.unwrap();

    assert_eq!(task.counts.succeeded, 1);
    let record = store.get_record(1).await.unwrap();
    assert_eq!(record.content_in("ja"), Some("修復済み"));
}

#[tokio::test]
async fn test_unparseable_response_keeps_raw_text() {
    let generator = Arc::new(ScriptedGenerator::new(|_, _| {
        Ok("抱歉，我无法完成这个请求。".to_string())
    }));
    let (orchestrator, store) = setup(vec![single_choice(1)], generator, config(1, 10));
    let before = store.get_record(1).await.unwrap();

    let task_id = orchestrator
        .submit(translate_request(vec![1], &["ja"]))
        .await
        .unwrap();
    let task = orchestrator.wait(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.counts.failed, 1);

    let item = &store.list_items(Some(&task_id)).await[0];
    let error = item.error_detail.as_ref().unwrap();
    assert_eq!(error.stage, ErrorStage::Parse);
    assert_eq!(error.code, "invalid_json");
    assert_eq!(item.ai_response.as_deref(), Some("抱歉，我无法完成这个请求。"));
    assert!(item.processed_data.is_none());
    assert_eq!(store.get_record(1).await.unwrap(), before);
}

#[tokio::test]
async fn test_slow_provider_times_out_without_touching_document() {
    let generator = Arc::new(
        ScriptedGenerator::new(|req, _| Ok(ja_translation(req))).with_delay(Duration::from_secs(5)),
    );
    let (orchestrator, store) = setup(vec![single_choice(1)], generator, config(1, 1));
    let before = store.get_record(1).await.unwrap();

    let task_id = orchestrator
        .submit(translate_request(vec![1], &["ja"]))
        .await
        .unwrap();
    let task = orchestrator.wait(&task_id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    let item = &store.list_items(Some(&task_id)).await[0];
    assert_eq!(item.status, SubtaskStatus::Failed);
    let error = item.error_detail.as_ref().unwrap();
    assert_eq!(error.stage, ErrorStage::ProviderTimeout);
    assert_eq!(error.code, "timeout");
    assert!(item.ai_response.is_none());
    assert_eq!(store.get_record(1).await.unwrap(), before);
}

#[tokio::test]
async fn test_resubmitting_unchanged_record_is_skipped() {
    let generator = Arc::new(ScriptedGenerator::new(|req, _| Ok(ja_translation(req))));
    let (orchestrator, store) = setup(vec![single_choice(1)], generator.clone(), config(1, 10));

    let first = orchestrator
        .submit(translate_request(vec![1], &["ja"]))
        .await
        .unwrap();
    orchestrator.wait(&first).await.unwrap();

    let second = orchestrator
        .submit(translate_request(vec![1], &["ja"]))
        .await
        .unwrap();
    let task = orchestrator.wait(&second).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.counts.skipped, 1);
    let item = &store.list_items(Some(&second)).await[0];
    assert_eq!(item.skip_reason, Some(SkipReason::Unchanged));
    assert_eq!(generator.total_calls(), 1);

    // 源内容变化后重新处理
    let mut record = store.get_record(1).await.unwrap();
    record = record.with_content("zh", "题干已修改");
    store.put_record(record).await.unwrap();

    let third = orchestrator
        .submit(translate_request(vec![1], &["ja"]))
        .await
        .unwrap();
    let task = orchestrator.wait(&third).await.unwrap();
    assert_eq!(task.counts.succeeded, 1);
    assert_eq!(generator.total_calls(), 2);
}

#[tokio::test]
async fn test_live_duplicate_across_tasks_is_in_flight() {
    let generator = Arc::new(
        ScriptedGenerator::new(|req, _| Ok(ja_translation(req)))
            .with_delay(Duration::from_millis(300)),
    );
    let (orchestrator, store) = setup(vec![single_choice(1)], generator.clone(), config(2, 10));

    let first = orchestrator
        .submit(translate_request(vec![1], &["ja"]))
        .await
        .unwrap();
    let second = orchestrator
        .submit(translate_request(vec![1], &["ja"]))
        .await
        .unwrap();

    let second_task = orchestrator.wait(&second).await.unwrap();
    let first_task = orchestrator.wait(&first).await.unwrap();

    assert_eq!(first_task.counts.succeeded, 1);
    assert_eq!(second_task.status, TaskStatus::Completed);
    assert_eq!(second_task.counts.skipped, 1);
    let item = &store.list_items(Some(&second)).await[0];
    assert_eq!(item.skip_reason, Some(SkipReason::InFlight));
    assert_eq!(generator.total_calls(), 1);
}

#[tokio::test]
async fn test_concurrent_languages_on_same_record_do_not_lose_updates() {
    let generator = Arc::new(
        ScriptedGenerator::new(|req, _| {
            let lang = req.target_language.clone().unwrap_or_default();
            Ok(format!(r#"{{"content": "content-{}"}}"#, lang))
        })
        .with_delay(Duration::from_millis(50)),
    );
    let (orchestrator, store) = setup(vec![single_choice(1)], generator, config(4, 10));

    let task_id = orchestrator
        .submit(translate_request(vec![1], &["ja", "ko", "fr"]))
        .await
        .unwrap();
    let task = orchestrator.wait(&task_id).await.unwrap();
    assert_eq!(task.counts.succeeded, 3);

    let record = store.get_record(1).await.unwrap();
    assert_eq!(record.content_in("ja"), Some("content-ja"));
    assert_eq!(record.content_in("ko"), Some("content-ko"));
    assert_eq!(record.content_in("fr"), Some("content-fr"));
    assert_eq!(record.content_in("en"), Some("Original English"));
}

#[tokio::test]
async fn test_partial_failure_still_completes_and_is_counted() {
    let generator = Arc::new(ScriptedGenerator::new(|req, _| {
        if req.record_id == 2 {
            Err(ProviderError::Rejected {
                message: "content policy".to_string(),
            })
        } else {
            Ok(ja_translation(req))
        }
    }));
    let records = vec![single_choice(1), single_choice(2)];
    let (orchestrator, store) = setup(records, generator, config(2, 10));

    let task_id = orchestrator
        .submit(translate_request(vec![1, 2, 404], &["ja"]))
        .await
        .unwrap();
    let task = orchestrator.wait(&task_id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.counts.succeeded, 1);
    assert_eq!(task.counts.failed, 2);
    assert!(store.get_record(1).await.unwrap().content_in("ja").is_some());
    assert!(store.get_record(2).await.unwrap().content_in("ja").is_none());

    let stats = orchestrator.error_stats(Some(&task_id)).await.unwrap();
    assert_eq!(stats.get(&ErrorStage::ProviderRejected), Some(&1));
    assert_eq!(stats.get(&ErrorStage::Validation), Some(&1));
}

#[tokio::test]
async fn test_task_without_valid_records_fails() {
    let generator = Arc::new(ScriptedGenerator::new(|req, _| Ok(ja_translation(req))));
    let (orchestrator, store) = setup(vec![], generator.clone(), config(1, 10));

    let task_id = orchestrator
        .submit(translate_request(vec![7, 8], &["ja"]))
        .await
        .unwrap();
    let task = orchestrator.wait(&task_id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.is_some());
    let items = store.list_items(Some(&task_id)).await;
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|i| {
        i.error_detail.as_ref().map(|e| e.code.as_str()) == Some("record_not_found")
    }));
    assert_eq!(generator.total_calls(), 0);
}

#[tokio::test]
async fn test_invalid_request_is_rejected_before_creating_task() {
    let generator = Arc::new(ScriptedGenerator::new(|req, _| Ok(ja_translation(req))));
    let (orchestrator, _store) = setup(vec![single_choice(1)], generator, config(1, 10));

    let err = orchestrator
        .submit(translate_request(vec![1], &[]))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let err = orchestrator
        .submit(translate_request(vec![1], &["zh"]))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let tasks = orchestrator
        .list_tasks(None, PageRequest::default())
        .await;
    assert_eq!(tasks.total, 0);
}

#[tokio::test]
async fn test_retry_failed_resubmits_only_failures() {
    let generator = Arc::new(ScriptedGenerator::new(|req, attempt| {
        if req.record_id == 2 && attempt == 0 {
            Err(ProviderError::Transport {
                message: "connection reset".to_string(),
            })
        } else {
            Ok(ja_translation(req))
        }
    }));
    let records = vec![single_choice(1), single_choice(2)];
    let (orchestrator, store) = setup(records, generator.clone(), config(2, 10));

    let first = orchestrator
        .submit(translate_request(vec![1, 2], &["ja"]))
        .await
        .unwrap();
    let task = orchestrator.wait(&first).await.unwrap();
    assert_eq!(task.counts.failed, 1);

    let retry = orchestrator.retry_failed(&first).await.unwrap();
    let retried = orchestrator.wait(&retry).await.unwrap();

    assert_eq!(retried.status, TaskStatus::Completed);
    assert_eq!(retried.record_ids, vec![2]);
    assert_eq!(retried.counts.succeeded, 1);
    assert!(store.get_record(2).await.unwrap().content_in("ja").is_some());
    assert_eq!(generator.total_calls(), 3);

    // 重试任务没有失败项
    assert!(orchestrator.retry_failed(&retry).await.is_err());
}

#[tokio::test]
async fn test_cancel_skips_undispatched_subtasks() {
    let generator = Arc::new(
        ScriptedGenerator::new(|req, _| Ok(ja_translation(req)))
            .with_delay(Duration::from_millis(200)),
    );
    let records: Vec<_> = (1..=5).map(single_choice).collect();
    let (orchestrator, store) = setup(records, generator, config(1, 10));

    let task_id = orchestrator
        .submit(translate_request(vec![1, 2, 3, 4, 5], &["ja"]))
        .await
        .unwrap();
    orchestrator.cancel(&task_id).await.unwrap();
    let task = orchestrator.wait(&task_id).await.unwrap();

    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.counts.total(), 5);
    assert_eq!(task.counts.finished(), 5);
    assert!(task.counts.succeeded <= 1);

    let items = store.list_items(Some(&task_id)).await;
    let cancelled = items
        .iter()
        .filter(|i| i.skip_reason == Some(SkipReason::Cancelled))
        .count();
    assert!(cancelled >= 4);

    // 已结束的任务不能再取消
    assert!(orchestrator.cancel(&task_id).await.is_err());
}

#[tokio::test]
async fn test_category_tags_replace_classification() {
    let generator = Arc::new(ScriptedGenerator::new(|_, _| {
        Ok(r#"{"category": "交通信号", "stage_tag": "Regular", "topic_tags": ["黄灯", "停车"], "license_types": ["C1"]}"#.to_string())
    }));
    let (orchestrator, store) = setup(vec![single_choice(1)], generator, config(1, 10));

    let task_id = orchestrator
        .submit(BatchRequest {
            record_ids: vec![1],
            operations: vec![Operation::CategoryTags],
            source_language: "zh".to_string(),
            target_languages: vec![],
        })
        .await
        .unwrap();
    let task = orchestrator.wait(&task_id).await.unwrap();
    assert_eq!(task.counts.succeeded, 1);

    let record = store.get_record(1).await.unwrap();
    assert_eq!(record.category.as_deref(), Some("交通信号"));
    assert_eq!(record.stage_tag, Some(StageTag::Regular));
    assert_eq!(record.topic_tags, vec!["黄灯".to_string(), "停车".to_string()]);
    assert_eq!(record.license_types, vec!["C1".to_string()]);
    assert!(record.content_in("ja").is_none());
}

#[tokio::test]
async fn test_fill_missing_keeps_existing_values() {
    let generator = Arc::new(ScriptedGenerator::new(|_, _| {
        Ok(r#"{"content": "不应覆盖", "explanation": "补全的解析"}"#.to_string())
    }));
    let record = QuestionRecord::new(1, QuestionType::Single)
        .with_content("zh", "原题干")
        .with_options("zh", &["甲", "乙"]);
    let (orchestrator, store) = setup(vec![record], generator, config(1, 10));

    let task_id = orchestrator
        .submit(BatchRequest {
            record_ids: vec![1],
            operations: vec![Operation::FillMissing],
            source_language: "zh".to_string(),
            target_languages: vec![],
        })
        .await
        .unwrap();
    orchestrator.wait(&task_id).await.unwrap();

    let record = store.get_record(1).await.unwrap();
    assert_eq!(record.content_in("zh"), Some("原题干"));
    assert_eq!(record.explanation_in("zh"), Some("补全的解析"));
}

#[tokio::test]
async fn test_inconsistent_explanation_is_reported_and_merged() {
    let generator = Arc::new(ScriptedGenerator::new(|_, _| {
        Ok(r#"{"content": "赤信号で右折できる。", "explanation": "この記述は正しいです。"}"#.to_string())
    }));
    let records = vec![true_false(1, "false"), true_false(2, "×")];
    let (orchestrator, store) = setup(records, generator, config(2, 10));

    let task_id = orchestrator
        .submit(translate_request(vec![1, 2], &["ja"]))
        .await
        .unwrap();
    let task = orchestrator.wait(&task_id).await.unwrap();
    assert_eq!(task.counts.succeeded, 2);

    // 一致性问题只记录，不阻止合并
    let record = store.get_record(1).await.unwrap();
    assert_eq!(record.explanation_in("ja"), Some("この記述は正しいです。"));

    let rows = orchestrator
        .consistency_report(ConsistencyFilter::default())
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!(row.consistency.entry.status, ConsistencyStatus::Inconsistent);
        assert_eq!(row.consistency.entry.expected, TruthValue::False);
        assert_eq!(row.consistency.entry.inferred, TruthValue::True);
        assert_eq!(row.consistency.entry.locale, "ja");
        assert_eq!(row.item.task_id, task_id);
    }
    assert!(rows[0].consistency.created_at <= rows[1].consistency.created_at);

    let only_polish = orchestrator
        .consistency_report(ConsistencyFilter {
            operation: Some(Operation::Polish),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(only_polish.is_empty());
}

#[tokio::test]
async fn test_consistent_explanation_is_not_reported() {
    let generator = Arc::new(ScriptedGenerator::new(|_, _| {
        Ok(r#"{"content": "赤信号で右折できる。", "explanation": "この記述は誤りです。"}"#.to_string())
    }));
    let (orchestrator, store) = setup(vec![true_false(1, "错")], generator, config(1, 10));

    let task_id = orchestrator
        .submit(translate_request(vec![1], &["ja"]))
        .await
        .unwrap();
    orchestrator.wait(&task_id).await.unwrap();

    let records = store.list_consistency().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].entry.status, ConsistencyStatus::Consistent);
    assert!(orchestrator
        .consistency_report(ConsistencyFilter::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_retrieval_failure_degrades_to_no_context() {
    let generator = Arc::new(ScriptedGenerator::new(|req, _| {
        assert!(req.context.is_empty());
        Ok(ja_translation(req))
    }));
    let config = Arc::new(Config {
        max_concurrent_subtasks: 1,
        request_timeout_secs: 10,
        retrieval_top_k: 3,
        ..Config::default()
    });
    let store = Arc::new(InMemoryStore::with_records(vec![single_choice(1)]));
    let orchestrator =
        TaskOrchestrator::new(config, store.clone(), generator, Arc::new(BrokenRetriever));

    let task_id = orchestrator
        .submit(translate_request(vec![1], &["ja"]))
        .await
        .unwrap();
    let task = orchestrator.wait(&task_id).await.unwrap();
    assert_eq!(task.counts.succeeded, 1);
}

#[tokio::test]
async fn test_task_detail_and_listing_are_paginated() {
    let generator = Arc::new(ScriptedGenerator::new(|req, _| Ok(ja_translation(req))));
    let records: Vec<_> = (1..=3).map(single_choice).collect();
    let (orchestrator, _store) = setup(records, generator, config(3, 10));

    let first = orchestrator
        .submit(translate_request(vec![1, 2, 3], &["ja"]))
        .await
        .unwrap();
    orchestrator.wait(&first).await.unwrap();
    let second = orchestrator
        .submit(translate_request(vec![1], &["ko"]))
        .await
        .unwrap();
    orchestrator.wait(&second).await.unwrap();

    let detail = orchestrator
        .task_detail(&first, PageRequest::new(1, 2))
        .await
        .unwrap();
    assert_eq!(detail.items.total, 3);
    assert_eq!(detail.items.items.len(), 2);
    let last_page = orchestrator
        .task_detail(&first, PageRequest::new(2, 2))
        .await
        .unwrap();
    assert_eq!(last_page.items.items.len(), 1);

    let tasks = orchestrator
        .list_tasks(Some(TaskStatus::Completed), PageRequest::default())
        .await;
    assert_eq!(tasks.total, 2);
    assert_eq!(tasks.items[0].task_id, second);

    assert!(orchestrator
        .task_detail("no-such-task", PageRequest::default())
        .await
        .is_err());
}

#[tokio::test]
async fn test_review_file_lists_failures_after_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let review_path = dir.path().join("review.txt");
    let generator = Arc::new(ScriptedGenerator::new(|req, _| {
        if req.record_id == 2 {
            Ok("not json at all".to_string())
        } else {
            Ok(ja_translation(req))
        }
    }));
    let store = Arc::new(InMemoryStore::with_records(vec![single_choice(1), single_choice(2)]));
    let orchestrator = TaskOrchestrator::with_review_writer(
        config(2, 10),
        store,
        generator,
        Arc::new(NoopRetriever),
        ReviewWriter::with_path(review_path.to_string_lossy().to_string()),
    );

    let task_id = orchestrator
        .submit(translate_request(vec![1, 2], &["ja"]))
        .await
        .unwrap();
    orchestrator.wait(&task_id).await.unwrap();
    orchestrator.shutdown().await;

    let content = std::fs::read_to_string(&review_path).unwrap();
    assert_eq!(content.lines().count(), 1);
    assert!(content.contains("题目 2"));
    assert!(content.contains("parse"));
}

fn ops_request(record_ids: Vec<u64>, operations: Vec<Operation>, targets: &[&str]) -> BatchRequest {
    BatchRequest {
        record_ids,
        operations,
        source_language: "zh".to_string(),
        target_languages: targets.iter().map(|t| t.to_string()).collect(),
    }
}

fn recording_setup(
    records: Vec<QuestionRecord>,
    generator: Arc<ScriptedGenerator>,
    config: Arc<Config>,
) -> (TaskOrchestrator, Arc<RecordingStore>) {
    let store = Arc::new(RecordingStore::with_records(records));
    let orchestrator =
        TaskOrchestrator::new(config, store.clone(), generator, Arc::new(NoopRetriever));
    (orchestrator, store)
}

#[tokio::test]
async fn test_retry_with_invalid_language_is_rejected() {
    let generator = Arc::new(ScriptedGenerator::new(|req, _| Ok(ja_translation(req))));
    let (orchestrator, _store) = setup(vec![single_choice(1)], generator, config(1, 10));

    assert!(!is_valid_language_code("日本語"));
    let err = orchestrator
        .submit_subtasks(
            "zh",
            vec![SubtaskSpec::new(1, Operation::Translate, Some("日本語".into()))],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let err = orchestrator
        .submit_subtasks("", vec![SubtaskSpec::new(1, Operation::Polish, None)])
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn test_polish_rewrites_only_existing_source_fields() {
    let generator = Arc::new(ScriptedGenerator::new(|_, _| {
        Ok(r#"{"content": "润色后的题干", "options": ["加速驶过", "停车等候"], "explanation": "润色后的解析"}"#.to_string())
    }));
    let record = QuestionRecord::new(1, QuestionType::Single)
        .with_content("zh", "原题干")
        .with_options("zh", &["加速通过", "停车等待"])
        .with_content("en", "Original English")
        .with_answer("B");
    let (orchestrator, store) = setup(vec![record], generator, config(1, 10));

    let task_id = orchestrator
        .submit(ops_request(vec![1], vec![Operation::Polish], &[]))
        .await
        .unwrap();
    let task = orchestrator.wait(&task_id).await.unwrap();
    assert_eq!(task.counts.succeeded, 1);

    let record = store.get_record(1).await.unwrap();
    assert_eq!(record.content_in("zh"), Some("润色后的题干"));
    assert_eq!(
        record.options_in("zh").unwrap(),
        &["加速驶过".to_string(), "停车等候".to_string()]
    );
    // 原本没有解析，润色不会新增
    assert!(record.explanation_in("zh").is_none());
    assert_eq!(record.content_in("en"), Some("Original English"));
}

#[tokio::test]
async fn test_polish_then_translate_in_one_batch_both_succeed() {
    let generator = Arc::new(
        ScriptedGenerator::new(|req, _| match req.operation {
            Operation::Polish => Ok(r#"{"content": "润色后的题干"}"#.to_string()),
            _ if req.user_prompt.contains("润色后的题干") => Ok(ja_translation(req)),
            _ => Err(ProviderError::Rejected {
                message: "翻译使用了旧的源内容".to_string(),
            }),
        })
        .with_delay(Duration::from_millis(50)),
    );
    let (orchestrator, store) = setup(vec![single_choice(1)], generator.clone(), config(4, 10));

    let task_id = orchestrator
        .submit(ops_request(
            vec![1],
            vec![Operation::Translate, Operation::Polish],
            &["ja"],
        ))
        .await
        .unwrap();
    let task = orchestrator.wait(&task_id).await.unwrap();

    assert_eq!(task.counts.succeeded, 2);
    assert_eq!(task.counts.failed, 0);
    let record = store.get_record(1).await.unwrap();
    assert_eq!(record.content_in("zh"), Some("润色后的题干"));
    assert_eq!(record.content_in("ja"), Some("問題1"));
    assert_eq!(generator.total_calls(), 2);
}

#[tokio::test]
async fn test_fill_missing_runs_before_polish_on_same_record() {
    let generator = Arc::new(
        ScriptedGenerator::new(|req, _| match req.operation {
            Operation::FillMissing => Ok(r#"{"explanation": "补全的解析"}"#.to_string()),
            _ if req.user_prompt.contains("补全的解析") => {
                Ok(r#"{"content": "润色后的题干", "explanation": "润色后的解析"}"#.to_string())
            }
            _ => Err(ProviderError::Rejected {
                message: "润色时解析仍然缺失".to_string(),
            }),
        })
        .with_delay(Duration::from_millis(50)),
    );
    let record = QuestionRecord::new(1, QuestionType::Single)
        .with_content("zh", "原题干")
        .with_options("zh", &["甲", "乙"])
        .with_answer("A");
    let (orchestrator, store) = setup(vec![record], generator, config(4, 10));

    let task_id = orchestrator
        .submit(ops_request(
            vec![1],
            vec![Operation::Polish, Operation::FillMissing],
            &[],
        ))
        .await
        .unwrap();
    let task = orchestrator.wait(&task_id).await.unwrap();

    assert_eq!(task.counts.succeeded, 2);
    let record = store.get_record(1).await.unwrap();
    assert_eq!(record.content_in("zh"), Some("润色后的题干"));
    assert_eq!(record.explanation_in("zh"), Some("润色后的解析"));
}

#[tokio::test]
async fn test_full_pipeline_polishes_translates_and_tags() {
    let generator = Arc::new(ScriptedGenerator::new(|req, _| {
        let lang = req.target_language.clone().unwrap_or_default();
        Ok(format!(
            r#"{{"content": {{"zh": "润色后的题干", "{lang}": "content-{lang}"}}, "explanation": {{"{lang}": "explanation-{lang}"}}, "category": "交通信号", "topic_tags": ["黄灯"]}}"#,
            lang = lang
        ))
    }));
    let (orchestrator, store) = setup(vec![single_choice(1)], generator.clone(), config(4, 10));

    let task_id = orchestrator
        .submit(ops_request(vec![1], vec![Operation::FullPipeline], &["ja", "en"]))
        .await
        .unwrap();
    let task = orchestrator.wait(&task_id).await.unwrap();

    assert_eq!(task.counts.succeeded, 2);
    assert_eq!(task.counts.failed, 0);
    let record = store.get_record(1).await.unwrap();
    assert_eq!(record.content_in("zh"), Some("润色后的题干"));
    assert_eq!(record.content_in("ja"), Some("content-ja"));
    assert_eq!(record.content_in("en"), Some("content-en"));
    assert_eq!(record.explanation_in("ja"), Some("explanation-ja"));
    assert_eq!(record.category.as_deref(), Some("交通信号"));
    assert_eq!(record.topic_tags, vec!["黄灯".to_string()]);
    assert_eq!(generator.total_calls(), 2);
}

#[tokio::test]
async fn test_mixed_operations_on_one_record_all_succeed() {
    let generator = Arc::new(
        ScriptedGenerator::new(|req, _| {
            let raw = match req.operation {
                Operation::FillMissing => r#"{"explanation": "补全的解析"}"#,
                Operation::Polish => r#"{"content": "润色后的题干"}"#,
                Operation::CategoryTags => r#"{"category": "交通信号", "license_types": ["C1"]}"#,
                _ => r#"{"content": "翻訳された問題"}"#,
            };
            Ok(raw.to_string())
        })
        .with_delay(Duration::from_millis(30)),
    );
    let record = QuestionRecord::new(1, QuestionType::Single)
        .with_content("zh", "原题干")
        .with_options("zh", &["甲", "乙"])
        .with_answer("A");
    let (orchestrator, store) = setup(vec![record], generator.clone(), config(4, 10));

    let task_id = orchestrator
        .submit(ops_request(
            vec![1],
            vec![
                Operation::Translate,
                Operation::CategoryTags,
                Operation::Polish,
                Operation::FillMissing,
            ],
            &["ja", "ko"],
        ))
        .await
        .unwrap();
    let task = orchestrator.wait(&task_id).await.unwrap();

    assert_eq!(task.counts.succeeded, 5);
    assert_eq!(task.counts.failed, 0);
    assert_eq!(task.details.len(), 1);
    let record = store.get_record(1).await.unwrap();
    assert_eq!(record.content_in("zh"), Some("润色后的题干"));
    assert_eq!(record.explanation_in("zh"), Some("补全的解析"));
    assert_eq!(record.content_in("ja"), Some("翻訳された問題"));
    assert_eq!(record.content_in("ko"), Some("翻訳された問題"));
    assert_eq!(record.category.as_deref(), Some("交通信号"));
    assert_eq!(generator.total_calls(), 5);
}

#[tokio::test]
async fn test_resubmitting_multi_language_batch_skips_every_language() {
    let generator = Arc::new(ScriptedGenerator::new(|req, _| {
        let lang = req.target_language.clone().unwrap_or_default();
        Ok(format!(r#"{{"content": "content-{}"}}"#, lang))
    }));
    let (orchestrator, store) = setup(vec![single_choice(1)], generator.clone(), config(2, 10));

    let first = orchestrator
        .submit(translate_request(vec![1], &["ja", "en"]))
        .await
        .unwrap();
    let task = orchestrator.wait(&first).await.unwrap();
    assert_eq!(task.counts.succeeded, 2);

    let second = orchestrator
        .submit(translate_request(vec![1], &["ja", "en"]))
        .await
        .unwrap();
    let task = orchestrator.wait(&second).await.unwrap();

    assert_eq!(task.counts.skipped, 2);
    assert!(store
        .list_items(Some(&second))
        .await
        .iter()
        .all(|i| i.skip_reason == Some(SkipReason::Unchanged)));
    assert_eq!(generator.total_calls(), 2);
}

#[tokio::test]
async fn test_source_edited_during_translation_is_merge_conflict() {
    let generator = Arc::new(
        ScriptedGenerator::new(|req, _| Ok(ja_translation(req)))
            .with_delay(Duration::from_millis(300)),
    );
    let (orchestrator, store) = setup(vec![single_choice(1)], generator, config(1, 10));

    let task_id = orchestrator
        .submit(translate_request(vec![1], &["ja"]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let edited = store
        .get_record(1)
        .await
        .unwrap()
        .with_content("zh", "处理期间修改的题干");
    store.put_record(edited.clone()).await.unwrap();

    let task = orchestrator.wait(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.counts.failed, 1);

    let item = &store.list_items(Some(&task_id)).await[0];
    let error = item.error_detail.as_ref().unwrap();
    assert_eq!(error.stage, ErrorStage::MergeConflict);
    assert_eq!(error.code, "source_changed");
    assert_eq!(store.get_record(1).await.unwrap(), edited);
}

#[tokio::test]
async fn test_subtask_statuses_only_move_forward() {
    let generator = Arc::new(
        ScriptedGenerator::new(|req, _| {
            if req.record_id == 2 {
                Err(ProviderError::Rejected {
                    message: "content policy".to_string(),
                })
            } else {
                Ok(ja_translation(req))
            }
        })
        .with_delay(Duration::from_millis(20)),
    );
    let records = vec![single_choice(1), single_choice(2), single_choice(3)];
    let (orchestrator, store) = recording_setup(records, generator, config(1, 10));

    let first = orchestrator
        .submit(translate_request(vec![1, 2, 404], &["ja"]))
        .await
        .unwrap();
    orchestrator.wait(&first).await.unwrap();
    let second = orchestrator
        .submit(translate_request(vec![1, 2], &["ja"]))
        .await
        .unwrap();
    orchestrator.wait(&second).await.unwrap();
    let third = orchestrator
        .submit(translate_request(vec![1, 2, 3], &["ko"]))
        .await
        .unwrap();
    orchestrator.cancel(&third).await.unwrap();
    orchestrator.wait(&third).await.unwrap();

    use SubtaskStatus::*;
    let allowed: [&[SubtaskStatus]; 6] = [
        &[Pending, Processing, Succeeded],
        &[Pending, Processing, Failed],
        &[Pending, Skipped],
        &[Skipped],
        &[Failed],
        &[Pending, Processing, Skipped],
    ];
    let history = store.history();
    let items = store.list_items(None).await;
    assert_eq!(history.len(), items.len());
    for item in &items {
        let seen = &history[&item.item_id];
        assert!(
            allowed.contains(&seen.as_slice()),
            "子任务 {} 的状态序列不合法: {:?}",
            item.item_id,
            seen
        );
        assert_eq!(seen.last(), Some(&item.status));
        assert!(item.status.is_terminal());
    }
}

#[tokio::test]
async fn test_failed_item_insert_releases_subtask_keys() {
    let generator = Arc::new(ScriptedGenerator::new(|req, _| Ok(ja_translation(req))));
    let (orchestrator, store) = recording_setup(vec![single_choice(1)], generator.clone(), config(1, 10));
    store.fail_next_insert.store(true, Ordering::SeqCst);

    let err = orchestrator
        .submit(translate_request(vec![1], &["ja"]))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Store(StoreError::WriteFailed(_))));
    assert!(store.list_tasks().await.is_empty());

    let task_id = orchestrator
        .submit(translate_request(vec![1], &["ja"]))
        .await
        .unwrap();
    let task = orchestrator.wait(&task_id).await.unwrap();
    assert_eq!(task.counts.succeeded, 1);
    assert_eq!(task.counts.skipped, 0);
    assert_eq!(generator.total_calls(), 1);
}

#[tokio::test]
async fn test_task_can_be_cancelled_as_soon_as_it_is_visible() {
    let generator = Arc::new(ScriptedGenerator::new(|req, _| Ok(ja_translation(req))));
    let records: Vec<_> = (1..=3).map(single_choice).collect();
    let (orchestrator, store) = recording_setup(records, generator.clone(), config(1, 10));
    store.slow_processing_save.store(true, Ordering::SeqCst);

    let submitter = orchestrator.clone();
    let submit = tokio::spawn(async move {
        submitter
            .submit(translate_request(vec![1, 2, 3], &["ja"]))
            .await
    });

    let mut visible = None;
    for _ in 0..100 {
        visible = store
            .list_tasks()
            .await
            .into_iter()
            .find(|t| t.status == TaskStatus::Processing)
            .map(|t| t.task_id);
        if visible.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let task_id = visible.unwrap();
    orchestrator.cancel(&task_id).await.unwrap();

    assert_eq!(submit.await.unwrap().unwrap(), task_id);
    let task = orchestrator.wait(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.counts.skipped, 3);
    assert_eq!(generator.total_calls(), 0);
}
