//! 稳定标识
//!
//! 由页面地址、标签、类名、id、DOM 路径和文本哈希推导出元素的缓存键。
//! 同一逻辑元素、同一文本总是得到相同的标识；文本变化则得到新标识。
//! 结构完全相同且文本相同的兄弟元素无法区分，这是已知限制。

use std::fmt;
use std::rc::Rc;

use markup5ever_rcdom::Handle;
use serde::{Deserialize, Serialize};

use crate::dom::{class_list, element_children, get_node_attr, get_node_name, get_parent_node};

/// 元素稳定标识
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableId(String);

impl StableId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for StableId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// 标识分配器，绑定到一个页面地址
#[derive(Debug, Clone)]
pub struct IdentityAssigner {
    page_url: String,
}

impl IdentityAssigner {
    pub fn new(page_url: impl Into<String>) -> Self {
        Self {
            page_url: page_url.into(),
        }
    }

    pub fn page_url(&self) -> &str {
        &self.page_url
    }

    pub fn set_page_url(&mut self, page_url: impl Into<String>) {
        self.page_url = page_url.into();
    }

    /// 计算元素标识
    pub fn compute_id(&self, element: &Handle, text: &str) -> StableId {
        let tag = get_node_name(element).unwrap_or_default();
        let class = get_node_attr(element, "class").unwrap_or_default();
        let id = get_node_attr(element, "id").unwrap_or_default();

        StableId(format!(
            "{}-{}-{}-{}-{}-{}",
            self.page_url,
            tag,
            class,
            id,
            dom_path(element),
            hash_string(text)
        ))
    }
}

/// 32 位滚动哈希（h = h * 31 + c，按 UTF-16 码元），取绝对值后以 36 进制输出
pub fn hash_string(s: &str) -> String {
    let hash = s
        .encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(unit as i32));
    to_base36((hash as i64).unsigned_abs())
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if value == 0 {
        return "0".to_string();
    }

    let mut digits = Vec::new();
    while value > 0 {
        digits.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// 从元素到 `<body>`（不含）的结构路径
pub fn dom_path(element: &Handle) -> String {
    let mut steps = Vec::new();
    let mut current = Some(element.clone());

    while let Some(node) = current {
        let Some(tag) = get_node_name(&node) else {
            break;
        };
        if tag == "body" || tag == "html" {
            break;
        }

        let mut step = tag.to_string();
        if let Some(id) = get_node_attr(&node, "id").filter(|id| !id.is_empty()) {
            step.push('#');
            step.push_str(&id);
        } else {
            let classes = class_list(&node);
            if !classes.is_empty() {
                step.push('.');
                step.push_str(&classes.iter().take(2).cloned().collect::<Vec<_>>().join("."));
            }
        }

        let parent = get_parent_node(&node);
        if let Some(parent) = &parent {
            let same_tag: Vec<Handle> = element_children(parent)
                .into_iter()
                .filter(|sibling| get_node_name(sibling) == Some(tag))
                .collect();
            if same_tag.len() > 1 {
                if let Some(index) = same_tag.iter().position(|s| Rc::ptr_eq(s, &node)) {
                    step.push_str(&format!(":nth-of-type({})", index + 1));
                }
            }
        }

        steps.push(step);
        current = parent;
    }

    steps.reverse();
    steps.join(" > ")
}

/// 面向用户的选择器：`#id`，否则 `.首个类名`，否则标签名
pub fn element_selector(element: &Handle) -> String {
    if let Some(id) = get_node_attr(element, "id").filter(|id| !id.is_empty()) {
        return format!("#{}", id);
    }
    if let Some(first) = class_list(element).into_iter().next() {
        return format!(".{}", first);
    }
    get_node_name(element).unwrap_or_default().to_lowercase()
}
