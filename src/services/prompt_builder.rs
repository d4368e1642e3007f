//! 提示词构建 - 业务能力层
//!
//! 只负责把"一道题 + 一个操作"拼成发给 AI 的提示词，不调用任何服务。

use serde_json::json;

use crate::models::{Operation, QuestionRecord, QuestionType, SourceFields};
use crate::services::retrieval::ContextSnippet;

const MISSING: &str = "[缺失]";

/// 发给 AI 的提示词
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// 构建子任务的提示词
///
/// 源语言没有任何可用内容时返回错误（属于校验失败，不会重试）。
pub fn build_prompt(
    operation: Operation,
    record: &QuestionRecord,
    source_language: &str,
    target_language: Option<&str>,
    context: &[ContextSnippet],
) -> Result<Prompt, String> {
    let source = record.source_fields(source_language);
    let is_truefalse = record.question_type == QuestionType::TrueFalse;

    let has_source = match operation {
        Operation::FillMissing => {
            source.content.is_some() || source.options.is_some() || source.explanation.is_some()
        }
        _ => source.content.is_some(),
    };
    if !has_source {
        return Err(format!(
            "题目 {} 缺少源语言 {} 的内容",
            record.id, source_language
        ));
    }

    let target = match (operation.is_per_language(), target_language) {
        (true, Some(target)) => Some(target),
        (true, None) => return Err(format!("操作 {} 需要目标语言", operation)),
        (false, _) => None,
    };

    let question = render_question(
        source,
        record.question_type,
        operation == Operation::FillMissing,
    );
    let system = system_prompt(operation, source_language, target);
    let format = output_format(operation, source_language, target, is_truefalse);

    let mut sections = vec![
        format!("Question Type: {}", record.question_type.as_str()),
        question,
    ];
    if let Some(answer) = record.correct_answer.as_deref() {
        sections.push(format!("Correct Answer: {}", answer));
    }
    if !context.is_empty() {
        sections.push(render_context(context));
    }
    sections.push(format!(
        "只返回一个 JSON 对象，不要输出任何解释性文字。格式如下：\n{}",
        format
    ));

    Ok(Prompt {
        system,
        user: sections.join("\n\n"),
    })
}

fn render_question(source: SourceFields<'_>, question_type: QuestionType, mark_missing: bool) -> String {
    let mut lines = Vec::new();
    match source.content {
        Some(content) => lines.push(format!("Content: {}", content)),
        None if mark_missing => lines.push(format!("Content: {}", MISSING)),
        None => {}
    }
    // 判断题没有选项
    if question_type != QuestionType::TrueFalse {
        match source.options {
            Some(options) => lines.push(format!("Options:\n- {}", options.join("\n- "))),
            None if mark_missing => lines.push(format!("Options: {}", MISSING)),
            None => {}
        }
    }
    match source.explanation {
        Some(explanation) => lines.push(format!("Explanation: {}", explanation)),
        None if mark_missing => lines.push(format!("Explanation: {}", MISSING)),
        None => {}
    }
    lines.join("\n")
}

fn render_context(context: &[ContextSnippet]) -> String {
    let items: Vec<String> = context
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let mut item = format!("[{}] {}\n{}", i + 1, c.title, c.snippet);
            if let Some(url) = &c.url {
                item.push_str(&format!("\n来源: {}", url));
            }
            item
        })
        .collect();
    format!("参考资料（仅供参考）：\n{}", items.join("\n\n"))
}

fn system_prompt(operation: Operation, source: &str, target: Option<&str>) -> String {
    let target = target.unwrap_or(source);
    match operation {
        Operation::Translate => format!(
            "你是专业的考试题目翻译。把题目从 {} 翻译为 {}，保持题意、术语和答案不变，语言自然流畅。",
            source, target
        ),
        Operation::Polish => format!(
            "你是专业的考试题目编辑。润色 {} 题目的措辞，使其通顺、准确，不得改变题意和答案。",
            source
        ),
        Operation::FillMissing => format!(
            "你是专业的考试题目编辑。为 {} 题目补全标记为 {} 的字段，已有字段保持不变。",
            source, MISSING
        ),
        Operation::CategoryTags => {
            "你是专业的考试题目分类助手。根据题目内容给出分类、考试阶段标签、知识点标签和适用驾照类型。"
                .to_string()
        }
        Operation::FullPipeline => format!(
            "你是专业的考试题目编辑兼翻译。先润色 {} 题目，再翻译为 {}，并给出分类与标签。",
            source, target
        ),
    }
}

fn localized_format(lang: &[&str], is_truefalse: bool) -> serde_json::Value {
    let text = |label: &str| {
        serde_json::Value::Object(
            lang.iter()
                .map(|l| (l.to_string(), json!(format!("<{} {}>", l, label))))
                .collect(),
        )
    };
    let mut format = json!({
        "content": text("content"),
        "explanation": text("explanation"),
    });
    if !is_truefalse {
        format["options"] = serde_json::Value::Object(
            lang.iter()
                .map(|l| (l.to_string(), json!([format!("<{} option>", l)])))
                .collect(),
        );
    }
    format
}

fn tags_format() -> serde_json::Value {
    json!({
        "category": "<category>",
        "stage_tag": "both | provisional | regular",
        "topic_tags": ["<tag>"],
        "license_types": ["<license type>"],
    })
}

fn output_format(
    operation: Operation,
    source: &str,
    target: Option<&str>,
    is_truefalse: bool,
) -> String {
    let value = match operation {
        Operation::Translate => localized_format(&[target.unwrap_or(source)], is_truefalse),
        Operation::Polish | Operation::FillMissing => localized_format(&[source], is_truefalse),
        Operation::CategoryTags => tags_format(),
        Operation::FullPipeline => {
            let langs: Vec<&str> = match target {
                Some(t) if t != source => vec![source, t],
                _ => vec![source],
            };
            let mut value = localized_format(&langs, is_truefalse);
            if let (Some(obj), Some(tags)) = (value.as_object_mut(), tags_format().as_object()) {
                obj.extend(tags.clone());
            }
            value
        }
    };
    serde_json::to_string_pretty(&value).unwrap_or_default()
}
