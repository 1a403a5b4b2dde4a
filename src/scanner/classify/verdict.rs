//! 分类结论

use std::fmt;

use serde::{Deserialize, Serialize};

/// 分类结论
///
/// `NoIssue` 是过渡标签，只在模型没有区分静态/动态时出现。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "Static/Issue")]
    StaticIssue,
    #[serde(rename = "Static/No_Issue")]
    StaticNoIssue,
    #[serde(rename = "Dynamic/Issue")]
    DynamicIssue,
    #[serde(rename = "Dynamic/No_Issue")]
    DynamicNoIssue,
    #[serde(rename = "No Issue")]
    NoIssue,
}

/// 内容类型：界面文本或用户内容
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Static,
    Dynamic,
}

impl Verdict {
    pub const ALL: [Verdict; 5] = [
        Verdict::StaticIssue,
        Verdict::StaticNoIssue,
        Verdict::DynamicIssue,
        Verdict::DynamicNoIssue,
        Verdict::NoIssue,
    ];

    /// 分类失败时的安全默认值
    pub const FALLBACK: Verdict = Verdict::StaticIssue;

    pub fn is_issue(self) -> bool {
        matches!(self, Verdict::StaticIssue | Verdict::DynamicIssue)
    }

    pub fn data_type(self) -> Option<DataType> {
        match self {
            Verdict::StaticIssue | Verdict::StaticNoIssue => Some(DataType::Static),
            Verdict::DynamicIssue | Verdict::DynamicNoIssue => Some(DataType::Dynamic),
            Verdict::NoIssue => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Verdict::StaticIssue => "Static/Issue",
            Verdict::StaticNoIssue => "Static/No_Issue",
            Verdict::DynamicIssue => "Dynamic/Issue",
            Verdict::DynamicNoIssue => "Dynamic/No_Issue",
            Verdict::NoIssue => "No Issue",
        }
    }

    /// 不区分大小写地匹配完整标签
    pub fn parse_label(label: &str) -> Option<Verdict> {
        let label = label.trim();
        Self::ALL
            .into_iter()
            .find(|verdict| verdict.label().eq_ignore_ascii_case(label))
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Static => f.write_str("static"),
            DataType::Dynamic => f.write_str("dynamic"),
        }
    }
}
