//! 响应修复服务 - 业务能力层
//!
//! 只负责把 AI 返回的"半结构化文本"修复为 JSON，不关心流程。
//!
//! 修复顺序：
//! 1. 去掉 markdown 代码块包裹
//! 2. 去掉 JSON 块前后的说明文字
//! 3. 去掉右括号前多余的逗号
//! 4. 清理控制字符
//!
//! 修复后仍无法严格解析时返回 [`RepairError`]，并保留原始响应。
//! 不会用空对象或默认值掩盖真正损坏的响应。

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::error::RepairError;
use crate::models::{Operation, ProcessedPayload};

/// 将原始响应修复并严格解析为 JSON
pub fn repair(raw: &str) -> Result<Value, RepairError> {
    let text = raw.trim().trim_start_matches('\u{feff}');
    let unfenced = strip_code_fence(text);
    let block = extract_json_block(&unfenced)
        .ok_or_else(|| RepairError::parse("响应中没有找到 JSON 对象或数组", raw))?;
    let without_commas = remove_trailing_commas(block);
    let cleaned = clean_control_chars(&without_commas);

    serde_json::from_str(&cleaned).map_err(|e| {
        debug!("修复后仍无法解析: {}", e);
        RepairError::parse(format!("JSON 解析失败: {}", e), raw)
    })
}

/// 修复响应并校验为对应操作的结构化结果
///
/// `default_language`：响应字段为纯字符串时归属的语言。
pub fn repair_payload(
    raw: &str,
    operation: Operation,
    default_language: &str,
) -> Result<ProcessedPayload, RepairError> {
    let value = repair(raw)?;
    ProcessedPayload::from_value(operation, default_language, &value)
        .map_err(|message| RepairError::parse(message, raw))
}

/// 去掉 ```json ... ``` 包裹；只有开头没有结尾的代码块也一并处理
fn strip_code_fence(text: &str) -> String {
    if let Ok(re) = Regex::new(r"(?s)```[A-Za-z]*[ \t]*\r?\n?(.*?)```") {
        if let Some(caps) = re.captures(text) {
            if let Some(inner) = caps.get(1) {
                return inner.as_str().trim().to_string();
            }
        }
    }

    if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        // 跳过语言标记所在的行
        let body = match rest.find('\n') {
            Some(newline) => &rest[newline + 1..],
            None => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
        };
        return body.trim().to_string();
    }

    text.to_string()
}

/// 截取第一个 `{` 或 `[` 开始、括号配平的片段
///
/// 括号未闭合时返回到结尾为止的内容，交给严格解析去报错。
fn extract_json_block(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }

    Some(&text[start..])
}

/// 去掉 `}` / `]` 之前多余的逗号（字符串内部不处理）
fn remove_trailing_commas(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for (i, &ch) in chars.iter().enumerate() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            out.push(ch);
            continue;
        }
        if ch == '"' {
            in_string = true;
        } else if ch == ',' {
            let next = chars[i + 1..].iter().find(|c| !c.is_whitespace());
            if matches!(next, Some('}') | Some(']')) {
                continue;
            }
        }
        out.push(ch);
    }

    out
}

/// 清理控制字符
///
/// 字符串外：保留换行、回车、制表符，其余丢弃；
/// 字符串内：换行、回车、制表符转义，其余丢弃。
fn clean_control_chars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if ch == '\u{feff}' {
            continue;
        }
        if in_string {
            if escaped {
                escaped = false;
                out.push(ch);
                continue;
            }
            match ch {
                '\\' => {
                    escaped = true;
                    out.push(ch);
                }
                '"' => {
                    in_string = false;
                    out.push(ch);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                c if c.is_control() => {}
                c => out.push(c),
            }
            continue;
        }
        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            '\n' | '\r' | '\t' => out.push(ch),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }

    out
}
