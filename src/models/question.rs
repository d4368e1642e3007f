use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// 按语言代码索引的文本（如 `{"zh": "...", "ja": "..."}`）
pub type LocalizedText = BTreeMap<String, String>;

/// 按语言代码索引的选项列表
pub type LocalizedOptions = BTreeMap<String, Vec<String>>;

/// 题目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionType {
    /// 单选
    #[default]
    Single,
    /// 多选
    Multiple,
    /// 判断题
    #[serde(alias = "true_false")]
    TrueFalse,
}

impl QuestionType {
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionType::Single => "single",
            QuestionType::Multiple => "multiple",
            QuestionType::TrueFalse => "truefalse",
        }
    }
}

/// 考试阶段标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageTag {
    Both,
    Provisional,
    Regular,
}

impl StageTag {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "both" => Some(StageTag::Both),
            "provisional" => Some(StageTag::Provisional),
            "regular" => Some(StageTag::Regular),
            _ => None,
        }
    }
}

/// 按语言索引的字段名
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalizedField {
    Content,
    Options,
    Explanation,
}

impl LocalizedField {
    pub const ALL: [LocalizedField; 3] = [
        LocalizedField::Content,
        LocalizedField::Options,
        LocalizedField::Explanation,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LocalizedField::Content => "content",
            LocalizedField::Options => "options",
            LocalizedField::Explanation => "explanation",
        }
    }
}

/// 题目（规范多语言文档）
///
/// 多语言字段为 `None` 表示"尚未生成"，不会出现空对象。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRecord {
    pub id: u64,
    #[serde(rename = "type", default)]
    pub question_type: QuestionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<LocalizedText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<LocalizedOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<LocalizedText>,
    #[serde(
        default,
        deserialize_with = "deserialize_answer",
        skip_serializing_if = "Option::is_none"
    )]
    pub correct_answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_tag: Option<StageTag>,
    #[serde(default)]
    pub topic_tags: Vec<String>,
    #[serde(default)]
    pub license_types: Vec<String>,
    #[serde(default)]
    pub content_hash: String,
}

impl QuestionRecord {
    pub fn new(id: u64, question_type: QuestionType) -> Self {
        Self {
            id,
            question_type,
            content: None,
            options: None,
            explanation: None,
            correct_answer: None,
            category: None,
            stage_tag: None,
            topic_tags: Vec::new(),
            license_types: Vec::new(),
            content_hash: String::new(),
        }
    }

    /// 设置某语言的题干
    pub fn with_content(mut self, lang: &str, text: &str) -> Self {
        self.content
            .get_or_insert_with(BTreeMap::new)
            .insert(lang.to_string(), text.to_string());
        self
    }

    /// 设置某语言的解析
    pub fn with_explanation(mut self, lang: &str, text: &str) -> Self {
        self.explanation
            .get_or_insert_with(BTreeMap::new)
            .insert(lang.to_string(), text.to_string());
        self
    }

    /// 设置某语言的选项
    pub fn with_options(mut self, lang: &str, options: &[&str]) -> Self {
        self.options.get_or_insert_with(BTreeMap::new).insert(
            lang.to_string(),
            options.iter().map(|o| o.to_string()).collect(),
        );
        self
    }

    pub fn with_answer(mut self, answer: &str) -> Self {
        self.correct_answer = Some(answer.to_string());
        self
    }

    /// 某语言的题干
    pub fn content_in(&self, lang: &str) -> Option<&str> {
        non_blank(self.content.as_ref()?.get(lang)?)
    }

    /// 某语言的解析
    pub fn explanation_in(&self, lang: &str) -> Option<&str> {
        non_blank(self.explanation.as_ref()?.get(lang)?)
    }

    /// 某语言的选项
    pub fn options_in(&self, lang: &str) -> Option<&[String]> {
        self.options
            .as_ref()?
            .get(lang)
            .map(|o| o.as_slice())
            .filter(|o| !o.is_empty())
    }

    /// 某语言下的全部多语言字段，用于判断源语言内容是否被并发修改
    pub fn source_fields(&self, lang: &str) -> SourceFields<'_> {
        SourceFields {
            content: self.content_in(lang),
            options: self.options_in(lang),
            explanation: self.explanation_in(lang),
        }
    }
}

/// 某一语言下的字段快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceFields<'a> {
    pub content: Option<&'a str>,
    pub options: Option<&'a [String]>,
    pub explanation: Option<&'a str>,
}

fn non_blank(text: &str) -> Option<&str> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

// 正确答案既可能是字符串，也可能是布尔值或数字
fn deserialize_answer<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Visitor;
    use std::fmt;

    struct AnswerVisitor;

    impl<'de> Visitor<'de> for AnswerVisitor {
        type Value = Option<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string, boolean or integer answer")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Some(value.to_string()))
        }

        fn visit_bool<E>(self, value: bool) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Some(value.to_string()))
        }

        fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Some(value.to_string()))
        }

        fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(Some(value.to_string()))
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(None)
        }

        fn visit_some<D>(self, deserializer: D) -> Result<Self::Value, D::Error>
        where
            D: serde::Deserializer<'de>,
        {
            deserializer.deserialize_any(AnswerVisitor)
        }
    }

    deserializer.deserialize_any(AnswerVisitor)
}
