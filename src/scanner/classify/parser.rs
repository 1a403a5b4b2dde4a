//! 分类响应解析
//!
//! 模型的回复是自由文本。每行依次尝试一组匹配器，第一个给出结论的匹配器生效：
//!
//! 1. 行内任意位置出现完整标签（不区分大小写）
//! 2. 编号前缀 `1.` / `1)`，剩余部分必须是完整标签，否则记为 `Static/Issue`
//! 3. 项目符号前缀 `-` / `*`，规则同上
//! 4. 单独的 `static` / `dynamic`
//! 5. 不含 "no" 的短行记为 `Static/Issue`
//!
//! 空行、超长行（多半是解释文字）以及没有匹配器认领的行被跳过。

use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use super::verdict::Verdict;
use crate::scanner::config::constants::{MAX_RESPONSE_LINE_CHARS, SHORT_LINE_CHARS};

type Matcher = fn(&str) -> Option<Verdict>;

const MATCHERS: &[(&str, Matcher)] = &[
    ("exact_label", exact_label),
    ("numbered", numbered),
    ("bulleted", bulleted),
    ("bare_token", bare_token),
    ("short_line", short_line),
];

fn label_regex() -> Option<&'static Regex> {
    static LABEL: OnceLock<Option<Regex>> = OnceLock::new();
    LABEL
        .get_or_init(|| {
            Regex::new(r"static/no_issue|dynamic/no_issue|static/issue|dynamic/issue|no issue").ok()
        })
        .as_ref()
}

fn numbered_regex() -> Option<&'static Regex> {
    static NUMBERED: OnceLock<Option<Regex>> = OnceLock::new();
    NUMBERED
        .get_or_init(|| Regex::new(r"^\d+[.)]\s*").ok())
        .as_ref()
}

fn bulleted_regex() -> Option<&'static Regex> {
    static BULLETED: OnceLock<Option<Regex>> = OnceLock::new();
    BULLETED
        .get_or_init(|| Regex::new(r"^[-*]\s*").ok())
        .as_ref()
}

/// 行内出现的第一个完整标签
pub fn exact_label(line: &str) -> Option<Verdict> {
    let lower = line.to_lowercase();
    let found = label_regex()?.find(&lower)?;
    Verdict::parse_label(found.as_str())
}

/// 编号列表项
pub fn numbered(line: &str) -> Option<Verdict> {
    strip_prefix_with(numbered_regex()?, line)
}

/// 项目符号列表项
pub fn bulleted(line: &str) -> Option<Verdict> {
    strip_prefix_with(bulleted_regex()?, line)
}

fn strip_prefix_with(prefix: &Regex, line: &str) -> Option<Verdict> {
    let found = prefix.find(line)?;
    let rest = line[found.end()..].trim();
    Some(Verdict::parse_label(rest).unwrap_or(Verdict::FALLBACK))
}

/// 单独的类别词
pub fn bare_token(line: &str) -> Option<Verdict> {
    match line.to_lowercase().as_str() {
        "static" => Some(Verdict::StaticIssue),
        "dynamic" => Some(Verdict::DynamicIssue),
        _ => None,
    }
}

/// 可能是结论的短行
pub fn short_line(line: &str) -> Option<Verdict> {
    let short = line.chars().count() < SHORT_LINE_CHARS;
    (short && !line.to_lowercase().contains("no")).then_some(Verdict::FALLBACK)
}

/// 解析单行，`None` 表示该行被跳过
pub fn parse_line(line: &str) -> Option<Verdict> {
    let line = line.trim();
    if line.is_empty() || line.chars().count() > MAX_RESPONSE_LINE_CHARS {
        return None;
    }

    MATCHERS.iter().find_map(|(name, matcher)| {
        let verdict = matcher(line)?;
        debug!("响应行 {:?} 由 {} 匹配为 {}", line, name, verdict);
        Some(verdict)
    })
}

/// 解析整段回复，不做数量修正
pub fn parse_response(content: &str) -> Vec<Verdict> {
    content.trim().lines().filter_map(parse_line).collect()
}

/// 把结论数量修正为输入数量：多余的截断，不足的以默认值补齐
pub fn normalize(mut verdicts: Vec<Verdict>, expected: usize) -> Vec<Verdict> {
    verdicts.truncate(expected);
    verdicts.resize(expected, Verdict::FALLBACK);
    verdicts
}
