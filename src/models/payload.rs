//! AI 响应的结构化结果
//!
//! 修复后的 JSON 在这里被一次性校验为按操作区分的类型，
//! 之后的流程不再接触无类型的 `serde_json::Value`。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::question::{LocalizedOptions, LocalizedText, StageTag};
use crate::models::task::Operation;

/// 多语言字段结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalizedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<LocalizedText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<LocalizedOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<LocalizedText>,
}

impl LocalizedPayload {
    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.options.is_none() && self.explanation.is_none()
    }
}

/// 分类与标签结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TagsPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_tag: Option<StageTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_types: Option<Vec<String>>,
}

impl TagsPayload {
    pub fn is_empty(&self) -> bool {
        self.category.is_none()
            && self.stage_tag.is_none()
            && self.topic_tags.is_none()
            && self.license_types.is_none()
    }
}

/// 按操作区分的结构化结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessedPayload {
    Translate(LocalizedPayload),
    Polish(LocalizedPayload),
    FillMissing(LocalizedPayload),
    CategoryTags(TagsPayload),
    FullPipeline {
        localized: LocalizedPayload,
        tags: Option<TagsPayload>,
    },
}

impl ProcessedPayload {
    /// 校验修复后的 JSON 并转换为对应操作的结果
    ///
    /// `default_language`：AI 直接返回字符串（而不是按语言索引的对象）时归属的语言。
    pub fn from_value(
        operation: Operation,
        default_language: &str,
        value: &Value,
    ) -> Result<Self, String> {
        let object = value
            .as_object()
            .ok_or_else(|| format!("响应不是 JSON 对象，而是 {}", value_kind(value)))?;

        match operation {
            Operation::Translate | Operation::Polish => {
                let localized = parse_localized(object, default_language)?;
                if localized.content.is_none() {
                    return Err("响应缺少 content 字段".to_string());
                }
                Ok(if operation == Operation::Translate {
                    ProcessedPayload::Translate(localized)
                } else {
                    ProcessedPayload::Polish(localized)
                })
            }
            Operation::FillMissing => {
                let localized = parse_localized(object, default_language)?;
                if localized.is_empty() {
                    return Err("响应中没有任何可补全的字段".to_string());
                }
                Ok(ProcessedPayload::FillMissing(localized))
            }
            Operation::CategoryTags => {
                let tags = parse_tags(object)?;
                if tags.is_empty() {
                    return Err("响应中没有分类或标签".to_string());
                }
                Ok(ProcessedPayload::CategoryTags(tags))
            }
            Operation::FullPipeline => {
                let localized = parse_localized(object, default_language)?;
                if localized.content.is_none() {
                    return Err("响应缺少 content 字段".to_string());
                }
                let tags = parse_tags(object)?;
                Ok(ProcessedPayload::FullPipeline {
                    localized,
                    tags: Some(tags).filter(|t| !t.is_empty()),
                })
            }
        }
    }

    pub fn localized(&self) -> Option<&LocalizedPayload> {
        match self {
            ProcessedPayload::Translate(l)
            | ProcessedPayload::Polish(l)
            | ProcessedPayload::FillMissing(l) => Some(l),
            ProcessedPayload::FullPipeline { localized, .. } => Some(localized),
            ProcessedPayload::CategoryTags(_) => None,
        }
    }

    pub fn tags(&self) -> Option<&TagsPayload> {
        match self {
            ProcessedPayload::CategoryTags(t) => Some(t),
            ProcessedPayload::FullPipeline { tags, .. } => tags.as_ref(),
            _ => None,
        }
    }

    /// 用新的多语言字段替换（过滤后的结果）
    pub fn with_localized(self, replacement: LocalizedPayload) -> Self {
        match self {
            ProcessedPayload::Translate(_) => ProcessedPayload::Translate(replacement),
            ProcessedPayload::Polish(_) => ProcessedPayload::Polish(replacement),
            ProcessedPayload::FillMissing(_) => ProcessedPayload::FillMissing(replacement),
            ProcessedPayload::FullPipeline { tags, .. } => ProcessedPayload::FullPipeline {
                localized: replacement,
                tags,
            },
            other @ ProcessedPayload::CategoryTags(_) => other,
        }
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn parse_localized(object: &Map<String, Value>, default_language: &str) -> Result<LocalizedPayload, String> {
    Ok(LocalizedPayload {
        content: parse_text_field(object.get("content"), "content", default_language)?,
        options: parse_options_field(object.get("options"), default_language)?,
        explanation: parse_text_field(object.get("explanation"), "explanation", default_language)?,
    })
}

fn parse_text_field(
    value: Option<&Value>,
    field: &str,
    default_language: &str,
) -> Result<Option<LocalizedText>, String> {
    let mut map = BTreeMap::new();
    match value {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(text)) => {
            if !text.trim().is_empty() {
                map.insert(default_language.to_string(), text.trim().to_string());
            }
        }
        Some(Value::Object(entries)) => {
            for (lang, text) in entries {
                match text {
                    Value::String(text) if !text.trim().is_empty() => {
                        map.insert(lang.clone(), text.trim().to_string());
                    }
                    Value::String(_) | Value::Null => {}
                    other => {
                        return Err(format!(
                            "{}.{} 应为字符串，实际为 {}",
                            field,
                            lang,
                            value_kind(other)
                        ))
                    }
                }
            }
        }
        Some(other) => {
            return Err(format!(
                "{} 应为字符串或按语言索引的对象，实际为 {}",
                field,
                value_kind(other)
            ))
        }
    }
    Ok(Some(map).filter(|m| !m.is_empty()))
}

fn parse_string_list(value: &Value, field: &str) -> Result<Vec<String>, String> {
    let items = value
        .as_array()
        .ok_or_else(|| format!("{} 应为数组，实际为 {}", field, value_kind(value)))?;
    Ok(items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect())
}

fn parse_options_field(
    value: Option<&Value>,
    default_language: &str,
) -> Result<Option<LocalizedOptions>, String> {
    let mut map = BTreeMap::new();
    match value {
        None | Some(Value::Null) => return Ok(None),
        Some(list @ Value::Array(_)) => {
            let options = parse_string_list(list, "options")?;
            if !options.is_empty() {
                map.insert(default_language.to_string(), options);
            }
        }
        Some(Value::Object(entries)) => {
            for (lang, list) in entries {
                if list.is_null() {
                    continue;
                }
                let options = parse_string_list(list, &format!("options.{}", lang))?;
                if !options.is_empty() {
                    map.insert(lang.clone(), options);
                }
            }
        }
        Some(other) => {
            return Err(format!(
                "options 应为数组或按语言索引的对象，实际为 {}",
                value_kind(other)
            ))
        }
    }
    Ok(Some(map).filter(|m| !m.is_empty()))
}

fn parse_tags(object: &Map<String, Value>) -> Result<TagsPayload, String> {
    let category = object
        .get("category")
        .and_then(Value::as_str)
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());
    // 非法的阶段标签视为未提供
    let stage_tag = object
        .get("stage_tag")
        .and_then(Value::as_str)
        .and_then(StageTag::parse);
    let topic_tags = match object.get("topic_tags") {
        None | Some(Value::Null) => None,
        Some(list) => Some(parse_string_list(list, "topic_tags")?),
    };
    let license_types = match object.get("license_types").or_else(|| object.get("license_tags")) {
        None | Some(Value::Null) => None,
        Some(list) => Some(parse_string_list(list, "license_types")?),
    };
    Ok(TagsPayload {
        category,
        stage_tag,
        topic_tags,
        license_types,
    })
}
