//! 解析一致性检查服务 - 业务能力层
//!
//! 只负责比较"解析隐含的判断"和"标准答案"，不关心流程。
//! 检查结果只是遥测，不会阻止合并。

use phf::phf_set;

use crate::models::{ConsistencyEntry, ConsistencyStatus, TruthValue};

static TRUE_KEYWORDS: phf::Set<&'static str> = phf_set! {
    "对", "正确", "是", "true", "t", "yes", "y", "正しい", "○", "o", "correct",
};

static FALSE_KEYWORDS: phf::Set<&'static str> = phf_set! {
    "错", "错误", "否", "不是", "false", "f", "no", "n", "誤", "×", "x", "✗", "incorrect",
};

/// 单一语言的判断短语表
struct PhraseTable {
    lang: &'static str,
    truthy: &'static [&'static str],
    falsy: &'static [&'static str],
}

const PHRASE_TABLES: &[PhraseTable] = &[
    PhraseTable {
        lang: "zh",
        truthy: &[
            "本题是正确的",
            "该题是正确的",
            "该说法是正确的",
            "此说法正确",
            "上述说法是正确的",
            "说法正确",
            "答案正确",
            "判断正确",
        ],
        falsy: &[
            "本题是错误的",
            "该题是错误的",
            "该说法是错误的",
            "此说法错误",
            "上述说法是错误的",
            "说法不正确",
            "答案错误",
            "判断错误",
            "不正确",
        ],
    },
    PhraseTable {
        lang: "ja",
        truthy: &[
            "この記述は正しいです",
            "この文は正しいです",
            "正しいです",
            "正しいと言えます",
            "正しいといえる",
        ],
        falsy: &[
            "この記述は誤りです",
            "この文は誤りです",
            "誤りです",
            "正しくありません",
            "間違いです",
            "誤っています",
        ],
    },
    PhraseTable {
        lang: "en",
        truthy: &["this statement is true", "this is correct", "is correct"],
        falsy: &[
            "this statement is false",
            "this statement is incorrect",
            "this is false",
            "this is incorrect",
            "is not correct",
        ],
    },
];

/// 将标准答案归一为真假值（"true"、"对"、"○" 等）
pub fn normalize_correct_answer(raw: Option<&str>) -> TruthValue {
    let text = raw.map(|r| r.trim().to_lowercase()).unwrap_or_default();
    if text.is_empty() {
        TruthValue::Unknown
    } else if TRUE_KEYWORDS.contains(text.as_str()) {
        TruthValue::True
    } else if FALSE_KEYWORDS.contains(text.as_str()) {
        TruthValue::False
    } else {
        TruthValue::Unknown
    }
}

/// "zh-CN" / "ja_JP" → "zh" / "ja"
fn base_language(locale: &str) -> String {
    locale
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase()
}

/// 从解析文本推断判断
///
/// `locale` 为空时扫描全部语言的短语表；同时命中"正确"与"错误"短语时返回未知。
pub fn infer_judgement(explanation: Option<&str>, locale: &str) -> TruthValue {
    let Some(text) = explanation.map(|e| e.trim().to_lowercase()).filter(|e| !e.is_empty())
    else {
        return TruthValue::Unknown;
    };

    let lang = base_language(locale);
    let mut has_true = false;
    let mut has_false = false;
    for table in PHRASE_TABLES
        .iter()
        .filter(|t| lang.is_empty() || t.lang == lang)
    {
        has_true |= table.truthy.iter().any(|p| text.contains(p));
        has_false |= table.falsy.iter().any(|p| text.contains(p));
    }

    match (has_true, has_false) {
        (true, false) => TruthValue::True,
        (false, true) => TruthValue::False,
        _ => TruthValue::Unknown,
    }
}

/// 比较解析与标准答案，生成一致性条目
pub fn check(
    explanation: Option<&str>,
    expected_answer: Option<&str>,
    locale: &str,
) -> ConsistencyEntry {
    let expected = normalize_correct_answer(expected_answer);
    let inferred = infer_judgement(explanation, locale);
    let status = match (expected, inferred) {
        (TruthValue::Unknown, _) | (_, TruthValue::Unknown) => ConsistencyStatus::Unknown,
        (e, i) if e == i => ConsistencyStatus::Consistent,
        _ => ConsistencyStatus::Inconsistent,
    };

    ConsistencyEntry {
        locale: locale.to_string(),
        expected,
        inferred,
        status,
    }
}
