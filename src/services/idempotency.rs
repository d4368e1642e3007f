//! 幂等键服务 - 业务能力层
//!
//! 只负责计算"内容哈希"和"子任务键"，没有副作用。

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::models::{
    LocalizedOptions, LocalizedText, Operation, QuestionRecord, QuestionType, StageTag,
};

/// 参与哈希的字段，字段顺序固定、映射按键排序
#[derive(Serialize)]
struct CanonicalRecord<'a> {
    question_type: QuestionType,
    content: BTreeMap<&'a str, &'a str>,
    options: BTreeMap<&'a str, Vec<&'a str>>,
    correct_answer: Option<String>,
    topic_tags: Vec<&'a str>,
    license_types: Vec<&'a str>,
}

/// 一个子任务能"看到"的输入：只含相关语言，标签只对生成标签的操作有意义
#[derive(Serialize)]
struct SubtaskInput<'a> {
    operation: Operation,
    question_type: QuestionType,
    content: BTreeMap<&'a str, &'a str>,
    options: BTreeMap<&'a str, Vec<&'a str>>,
    explanation: BTreeMap<&'a str, &'a str>,
    correct_answer: Option<String>,
    tags: Option<TagsView<'a>>,
}

#[derive(Serialize)]
struct TagsView<'a> {
    category: Option<&'a str>,
    stage_tag: Option<StageTag>,
    topic_tags: Vec<&'a str>,
    license_types: Vec<&'a str>,
}

/// 计算题目的内容哈希（SHA-256 十六进制）
///
/// 覆盖类型、题干、选项、正确答案与标签；空白值与缺失等价，标签顺序无关。
pub fn record_hash(record: &QuestionRecord) -> String {
    let canonical = CanonicalRecord {
        question_type: record.question_type,
        content: text_slots(record.content.as_ref(), |_| true),
        options: option_slots(record.options.as_ref(), |_| true),
        correct_answer: normalized_answer(record),
        topic_tags: sorted_tags(&record.topic_tags),
        license_types: sorted_tags(&record.license_types),
    };
    digest(&canonical)
}

/// 计算子任务输入视图的哈希，用于幂等判断
///
/// 只包含源语言和目标语言的字段。同一题目其他语言的写入不会改变它，
/// 所以多语言批次重复提交时每个语言都能被识别为"未变化"。
pub fn subtask_input_hash(
    record: &QuestionRecord,
    operation: Operation,
    source_language: &str,
    target_language: Option<&str>,
) -> String {
    let in_scope = |lang: &str| lang == source_language || Some(lang) == target_language;
    let tags = matches!(operation, Operation::CategoryTags | Operation::FullPipeline).then(|| {
        TagsView {
            category: record.category.as_deref().map(str::trim).filter(|c| !c.is_empty()),
            stage_tag: record.stage_tag,
            topic_tags: sorted_tags(&record.topic_tags),
            license_types: sorted_tags(&record.license_types),
        }
    });

    let input = SubtaskInput {
        operation,
        question_type: record.question_type,
        content: text_slots(record.content.as_ref(), in_scope),
        options: option_slots(record.options.as_ref(), in_scope),
        explanation: text_slots(record.explanation.as_ref(), in_scope),
        correct_answer: normalized_answer(record),
        tags,
    };
    digest(&input)
}

fn digest<T: Serialize>(value: &T) -> String {
    // 结构体与 BTreeMap 的序列化不会失败
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

fn text_slots<'a>(
    map: Option<&'a LocalizedText>,
    keep: impl Fn(&str) -> bool,
) -> BTreeMap<&'a str, &'a str> {
    map.into_iter()
        .flatten()
        .filter(|(lang, text)| keep(lang) && !text.trim().is_empty())
        .map(|(lang, text)| (lang.as_str(), text.trim()))
        .collect()
}

fn option_slots<'a>(
    map: Option<&'a LocalizedOptions>,
    keep: impl Fn(&str) -> bool,
) -> BTreeMap<&'a str, Vec<&'a str>> {
    map.into_iter()
        .flatten()
        .filter(|(lang, opts)| keep(lang) && !opts.is_empty())
        .map(|(lang, opts)| (lang.as_str(), opts.iter().map(|o| o.trim()).collect::<Vec<_>>()))
        .collect()
}

fn normalized_answer(record: &QuestionRecord) -> Option<String> {
    record
        .correct_answer
        .as_deref()
        .map(|a| a.trim().to_lowercase())
        .filter(|a| !a.is_empty())
}

fn sorted_tags(tags: &[String]) -> Vec<&str> {
    let mut tags: Vec<&str> = tags
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect();
    tags.sort_unstable();
    tags.dedup();
    tags
}

/// 子任务键：(题目, 操作, 目标语言)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubtaskKey {
    pub record_id: u64,
    pub operation: Operation,
    pub target_language: Option<String>,
}

impl fmt::Display for SubtaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.record_id,
            self.operation,
            self.target_language.as_deref().unwrap_or("-")
        )
    }
}

/// 生成子任务键
pub fn subtask_key(record_id: u64, operation: Operation, target_language: Option<&str>) -> SubtaskKey {
    SubtaskKey {
        record_id,
        operation,
        target_language: target_language.map(|l| l.to_string()),
    }
}
