//! 文本提取器
//!
//! 遍历 DOM，按固定的标签列表找出可扫描的叶子文本元素，
//! 过滤隐藏元素、容器元素以及嵌套了同类元素的外层节点。

use markup5ever_rcdom::Handle;
use tracing::{debug, warn};

use super::identity::element_selector;
use crate::dom::{
    ancestors, class_name, descendant_elements, direct_text, element_children, get_node_attr,
    get_node_name, has_element_children, text_content,
};
use crate::scanner::config::constants::{HIDDEN_ANCESTOR_TAGS, PLACEHOLDER_TAGS, TEXT_TAGS};
use crate::scanner::config::ExtractorConfig;
use crate::scanner::error::{ScanError, ScanResult};

/// 可扫描元素（仅在单次扫描中存在）
#[derive(Debug, Clone)]
pub struct ScannableElement {
    pub node: Handle,
    pub text: String,
    pub tag_name: String,
    pub class_name: String,
    pub selector: String,
}

/// 文本提取器
#[derive(Debug, Clone, Default)]
pub struct TextExtractor {
    config: ExtractorConfig,
}

impl TextExtractor {
    pub fn new(config: ExtractorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// 提取候选元素
    ///
    /// 按标签列表顺序分组，每组内保持文档顺序。单个元素出错时跳过，不影响整体。
    pub fn extract_candidates(&self, root: &Handle) -> Vec<ScannableElement> {
        let all_elements = descendant_elements(root);
        let mut candidates = Vec::new();
        let mut skipped = 0usize;

        for tag in TEXT_TAGS {
            for node in all_elements
                .iter()
                .filter(|node| get_node_name(node) == Some(*tag))
            {
                match self.inspect(node) {
                    Ok(Some(element)) => candidates.push(element),
                    Ok(None) => skipped += 1,
                    Err(e) => {
                        warn!("提取元素文本失败，已跳过: {}", e);
                        skipped += 1;
                    }
                }
            }
        }

        debug!(
            "文本提取完成: {} 个候选，{} 个被过滤",
            candidates.len(),
            skipped
        );
        candidates
    }

    /// 检查单个元素
    pub fn inspect(&self, node: &Handle) -> ScanResult<Option<ScannableElement>> {
        ensure_readable(node)?;

        let tag = get_node_name(node).unwrap_or_default().to_string();

        if PLACEHOLDER_TAGS.contains(&tag.as_str()) && get_node_attr(node, "placeholder").is_none() {
            return Ok(None);
        }

        if self.has_nested_text_element(node) || self.is_container(node) || is_hidden(node) {
            return Ok(None);
        }

        let text = self.extract_text(node);
        if text.is_empty() {
            return Ok(None);
        }

        Ok(Some(ScannableElement {
            node: node.clone(),
            text,
            tag_name: tag,
            class_name: class_name(node),
            selector: element_selector(node),
        }))
    }

    /// 提取元素文本
    ///
    /// 表单元素取 placeholder 或 value；其他元素只拼接直接文本子节点，
    /// 为空且没有子元素时退回到完整文本。超过上限视为容器，返回空串。
    pub fn extract_text(&self, node: &Handle) -> String {
        let tag = get_node_name(node).unwrap_or_default();

        let raw = if PLACEHOLDER_TAGS.contains(&tag) {
            get_node_attr(node, "placeholder")
                .filter(|p| !p.is_empty())
                .or_else(|| get_node_attr(node, "value"))
                .unwrap_or_default()
        } else {
            let direct = direct_text(node);
            if direct.trim().is_empty() && !has_element_children(node) {
                text_content(node)
            } else {
                direct
            }
        };

        if raw.chars().count() > self.config.max_text_chars {
            return String::new();
        }

        raw.trim().to_string()
    }

    /// 是否含有同类文本子元素
    fn has_nested_text_element(&self, node: &Handle) -> bool {
        descendant_elements(node).iter().any(|child| {
            get_node_name(child)
                .is_some_and(|name| TEXT_TAGS.contains(&name) && !PLACEHOLDER_TAGS.contains(&name))
        })
    }

    /// 容器启发式：子元素过多、文本过长或类名含容器关键词
    fn is_container(&self, node: &Handle) -> bool {
        if element_children(node).len() > self.config.max_children {
            return true;
        }

        if text_content(node).chars().count() > self.config.max_container_text_chars {
            return true;
        }

        let class = class_name(node).to_lowercase();
        self.config
            .container_keywords
            .iter()
            .any(|keyword| class.contains(keyword.as_str()))
    }
}

fn ensure_readable(node: &Handle) -> ScanResult<()> {
    node.children
        .try_borrow()
        .map_err(|e| ScanError::ExtractionError(format!("子节点正被修改: {}", e)))?;

    if let markup5ever_rcdom::NodeData::Element { attrs, .. } = &node.data {
        attrs
            .try_borrow()
            .map_err(|e| ScanError::ExtractionError(format!("属性正被修改: {}", e)))?;
    }

    Ok(())
}

/// 隐藏检测
///
/// 自身的 hidden 属性或内联 display/visibility/opacity；
/// 祖先的 hidden、display:none、visibility:hidden；以及位于 head/script 等不可见区域。
pub fn is_hidden(node: &Handle) -> bool {
    if get_node_attr(node, "hidden").is_some() {
        return true;
    }

    let own_style = inline_style(node);
    if own_style.display_none || own_style.visibility_hidden || own_style.opacity_zero {
        return true;
    }

    ancestors(node).iter().any(|ancestor| {
        if get_node_name(ancestor).is_some_and(|name| HIDDEN_ANCESTOR_TAGS.contains(&name)) {
            return true;
        }
        if get_node_attr(ancestor, "hidden").is_some() {
            return true;
        }
        let style = inline_style(ancestor);
        style.display_none || style.visibility_hidden
    })
}

#[derive(Debug, Default)]
struct InlineStyle {
    display_none: bool,
    visibility_hidden: bool,
    opacity_zero: bool,
}

fn inline_style(node: &Handle) -> InlineStyle {
    let mut style = InlineStyle::default();
    let Some(raw) = get_node_attr(node, "style") else {
        return style;
    };

    for declaration in raw.split(';') {
        let Some((property, value)) = declaration.split_once(':') else {
            continue;
        };
        let property = property.trim().to_lowercase();
        let value = value
            .trim()
            .trim_end_matches("!important")
            .trim()
            .to_lowercase();

        match property.as_str() {
            "display" => style.display_none = value == "none",
            "visibility" => style.visibility_hidden = value == "hidden" || value == "collapse",
            "opacity" => style.opacity_zero = value.parse::<f32>().is_ok_and(|o| o <= 0.0),
            _ => {}
        }
    }

    style
}
