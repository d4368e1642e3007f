//! 目标语言过滤/合并服务 - 业务能力层
//!
//! 只负责把结构化结果按语言合并进题目，不关心流程。
//! 不在允许列表中的语言永远不会被改动，即使 AI 响应里带了这些语言。

use std::collections::BTreeMap;

use crate::models::{
    LocalizedField, LocalizedPayload, Operation, QuestionRecord, QuestionType, TagsPayload,
};

/// 多语言字段写入方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// 直接覆盖（translate / full_pipeline）
    Overwrite,
    /// 只改写已有的非空值（polish）
    OnlyExisting,
    /// 只写入当前缺失或为空的值（fill_missing）
    OnlyMissing,
}

impl WriteMode {
    pub fn for_operation(operation: Operation) -> Self {
        match operation {
            Operation::Polish => WriteMode::OnlyExisting,
            Operation::FillMissing => WriteMode::OnlyMissing,
            _ => WriteMode::Overwrite,
        }
    }
}

/// 某个操作允许写入的语言
pub fn allowed_languages(
    operation: Operation,
    source_language: &str,
    target_language: Option<&str>,
) -> Vec<String> {
    match operation {
        Operation::Translate => target_language.map(str::to_string).into_iter().collect(),
        Operation::Polish | Operation::FillMissing => vec![source_language.to_string()],
        Operation::FullPipeline => {
            let mut langs = vec![source_language.to_string()];
            if let Some(target) = target_language.filter(|t| *t != source_language) {
                langs.push(target.to_string());
            }
            langs
        }
        Operation::CategoryTags => Vec::new(),
    }
}

/// 某题型需要合并的多语言字段（判断题没有选项）
pub fn localized_fields(question_type: QuestionType) -> Vec<LocalizedField> {
    LocalizedField::ALL
        .into_iter()
        .filter(|f| !(question_type == QuestionType::TrueFalse && *f == LocalizedField::Options))
        .collect()
}

trait Blank {
    fn is_blank(&self) -> bool;
}

impl Blank for String {
    fn is_blank(&self) -> bool {
        self.trim().is_empty()
    }
}

impl Blank for Vec<String> {
    fn is_blank(&self) -> bool {
        self.iter().all(|o| o.trim().is_empty())
    }
}

fn filter_map<V: Clone>(
    map: Option<&BTreeMap<String, V>>,
    allowed: &[String],
) -> Option<BTreeMap<String, V>> {
    let filtered: BTreeMap<String, V> = map?
        .iter()
        .filter(|(lang, _)| allowed.contains(lang))
        .map(|(lang, value)| (lang.clone(), value.clone()))
        .collect();
    Some(filtered).filter(|m| !m.is_empty())
}

/// 只保留允许语言的字段；过滤后为空的字段变为 `None`
pub fn filter_payload(payload: &LocalizedPayload, allowed: &[String]) -> LocalizedPayload {
    LocalizedPayload {
        content: filter_map(payload.content.as_ref(), allowed),
        options: filter_map(payload.options.as_ref(), allowed),
        explanation: filter_map(payload.explanation.as_ref(), allowed),
    }
}

fn merge_field<V: Blank + Clone>(
    existing: &Option<BTreeMap<String, V>>,
    incoming: Option<&BTreeMap<String, V>>,
    allowed: &[String],
    mode: WriteMode,
) -> Option<BTreeMap<String, V>> {
    // 本次操作没有涉及该字段，原样保留
    let Some(incoming) = incoming else {
        return existing.clone();
    };

    let mut merged = existing.clone().unwrap_or_default();
    for (lang, value) in incoming {
        if !allowed.contains(lang) || value.is_blank() {
            continue;
        }
        let has_value = merged.get(lang).is_some_and(|v| !v.is_blank());
        let write = match mode {
            WriteMode::Overwrite => true,
            WriteMode::OnlyExisting => has_value,
            WriteMode::OnlyMissing => !has_value,
        };
        if write {
            merged.insert(lang.clone(), value.clone());
        }
    }

    Some(merged).filter(|m| !m.is_empty())
}

/// 将多语言结果合并进题目，返回新文档
///
/// 只处理 `fields` 中列出的字段、只写 `allowed` 中的语言，
/// 其余语言与字段保持原样。
pub fn merge_localized(
    doc: &QuestionRecord,
    payload: &LocalizedPayload,
    allowed: &[String],
    fields: &[LocalizedField],
    mode: WriteMode,
) -> QuestionRecord {
    let mut updated = doc.clone();
    for field in fields {
        match field {
            LocalizedField::Content => {
                updated.content =
                    merge_field(&doc.content, payload.content.as_ref(), allowed, mode);
            }
            LocalizedField::Options => {
                updated.options =
                    merge_field(&doc.options, payload.options.as_ref(), allowed, mode);
            }
            LocalizedField::Explanation => {
                updated.explanation =
                    merge_field(&doc.explanation, payload.explanation.as_ref(), allowed, mode);
            }
        }
    }
    updated
}

/// 应用分类与标签：提供了的字段整体替换，未提供的保持原样
pub fn apply_tags(doc: &QuestionRecord, tags: &TagsPayload) -> QuestionRecord {
    let mut updated = doc.clone();
    if let Some(category) = &tags.category {
        updated.category = Some(category.clone());
    }
    if let Some(stage_tag) = tags.stage_tag {
        updated.stage_tag = Some(stage_tag);
    }
    if let Some(topic_tags) = &tags.topic_tags {
        updated.topic_tags = topic_tags.clone();
    }
    if let Some(license_types) = &tags.license_types {
        updated.license_types = license_types.clone();
    }
    updated
}
