//! DOM 辅助函数
//!
//! 基于 html5ever + markup5ever_rcdom 的节点读写工具，以及可观察的页面文档封装

pub mod page;

use std::io;
use std::rc::Rc;

use encoding_rs::Encoding;
use html5ever::parse_document;
use html5ever::tendril::TendrilSink;
use html5ever::{namespace_url, ns};
use markup5ever_rcdom::{Handle, NodeData, RcDom};

pub use page::{PageDocument, PageEvent};

/// 将 HTML 字节转换为 DOM
pub fn html_to_dom(data: &[u8], document_encoding: &str) -> io::Result<RcDom> {
    let s: String = match Encoding::for_label(document_encoding.as_bytes()) {
        Some(encoding) => {
            let (string, _, _) = encoding.decode(data);
            string.to_string()
        }
        None => String::from_utf8_lossy(data).to_string(),
    };

    parse_document(RcDom::default(), Default::default())
        .from_utf8()
        .read_from(&mut s.as_bytes())
}

/// 查找指定路径的DOM节点
pub fn find_nodes(node: &Handle, node_names: &[&str]) -> Vec<Handle> {
    let Some((node_name, rest)) = node_names.split_first() else {
        return Vec::new();
    };

    let mut found_nodes = Vec::new();
    let matches_here = get_node_name(node) == Some(*node_name);

    if matches_here && rest.is_empty() {
        found_nodes.push(node.clone());
    } else if matches_here {
        found_nodes.extend(find_nodes_in_children(node, rest));
        return found_nodes;
    }

    found_nodes.extend(find_nodes_in_children(node, node_names));
    found_nodes
}

fn find_nodes_in_children(node: &Handle, node_names: &[&str]) -> Vec<Handle> {
    node.children
        .borrow()
        .iter()
        .flat_map(|child| find_nodes(child, node_names))
        .collect()
}

/// 获取 `<body>`，找不到时返回文档根节点
pub fn find_body(document: &Handle) -> Handle {
    find_nodes(document, &["html", "body"])
        .into_iter()
        .next()
        .unwrap_or_else(|| document.clone())
}

/// 获取节点属性值
pub fn get_node_attr(node: &Handle, attr_name: &str) -> Option<String> {
    match &node.data {
        NodeData::Element { attrs, .. } => attrs
            .borrow()
            .iter()
            .find(|attr| &*attr.name.local == attr_name)
            .map(|attr| attr.value.to_string()),
        _ => None,
    }
}

/// 获取节点名称
pub fn get_node_name(node: &Handle) -> Option<&'_ str> {
    match &node.data {
        NodeData::Element { name, .. } => Some(name.local.as_ref()),
        _ => None,
    }
}

/// 获取父节点（不破坏弱引用）
pub fn get_parent_node(child: &Handle) -> Option<Handle> {
    let weak = child.parent.take();
    let parent = weak.as_ref().and_then(|node| node.upgrade());
    child.parent.set(weak);
    parent
}

/// 设置节点属性，`None` 表示删除
pub fn set_node_attr(node: &Handle, attr_name: &str, attr_value: Option<&str>) {
    use html5ever::interface::{Attribute, QualName};
    use html5ever::tendril::format_tendril;
    use html5ever::LocalName;

    if let NodeData::Element { attrs, .. } = &node.data {
        let mut attrs_mut = attrs.borrow_mut();

        match attr_value {
            Some(value) => {
                if let Some(existing) = attrs_mut
                    .iter_mut()
                    .find(|attr| &*attr.name.local == attr_name)
                {
                    existing.value.clear();
                    existing.value.push_slice(value);
                } else {
                    attrs_mut.push(Attribute {
                        name: QualName::new(None, ns!(), LocalName::from(attr_name)),
                        value: format_tendril!("{}", value),
                    });
                }
            }
            None => attrs_mut.retain(|attr| &*attr.name.local != attr_name),
        }
    }
}

pub fn is_element(node: &Handle) -> bool {
    matches!(node.data, NodeData::Element { .. })
}

pub fn is_text(node: &Handle) -> bool {
    matches!(node.data, NodeData::Text { .. })
}

/// 直接元素子节点
pub fn element_children(node: &Handle) -> Vec<Handle> {
    node.children
        .borrow()
        .iter()
        .filter(|child| is_element(child))
        .cloned()
        .collect()
}

pub fn has_element_children(node: &Handle) -> bool {
    node.children.borrow().iter().any(is_element)
}

/// 仅拼接直接文本子节点
pub fn direct_text(node: &Handle) -> String {
    let mut text = String::new();
    for child in node.children.borrow().iter() {
        if let NodeData::Text { contents } = &child.data {
            text.push_str(&contents.borrow());
        }
    }
    text
}

/// 递归收集全部文本（相当于 textContent）
pub fn text_content(node: &Handle) -> String {
    let mut text = String::new();
    collect_text(node, &mut text);
    text
}

fn collect_text(node: &Handle, out: &mut String) {
    match &node.data {
        NodeData::Text { contents } => out.push_str(&contents.borrow()),
        _ => {
            for child in node.children.borrow().iter() {
                collect_text(child, out);
            }
        }
    }
}

pub fn class_name(node: &Handle) -> String {
    get_node_attr(node, "class").unwrap_or_default()
}

pub fn class_list(node: &Handle) -> Vec<String> {
    class_name(node)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

pub fn has_class(node: &Handle, class: &str) -> bool {
    class_name(node).split_whitespace().any(|c| c == class)
}

/// 文档顺序的后代元素（不含自身）
pub fn descendant_elements(root: &Handle) -> Vec<Handle> {
    let mut found = Vec::new();
    walk_elements(root, &mut found);
    found
}

fn walk_elements(node: &Handle, found: &mut Vec<Handle>) {
    for child in node.children.borrow().iter() {
        if is_element(child) {
            found.push(child.clone());
        }
        walk_elements(child, found);
    }
}

/// 按标签名查找后代元素
pub fn elements_by_tag(root: &Handle, tag: &str) -> Vec<Handle> {
    descendant_elements(root)
        .into_iter()
        .filter(|node| get_node_name(node) == Some(tag))
        .collect()
}

/// `ancestor` 是否包含 `node`（包括自身）
pub fn contains(ancestor: &Handle, node: &Handle) -> bool {
    let mut current = Some(node.clone());
    while let Some(candidate) = current {
        if Rc::ptr_eq(&candidate, ancestor) {
            return true;
        }
        current = get_parent_node(&candidate);
    }
    false
}

/// 元素祖先链（由近及远）
pub fn ancestors(node: &Handle) -> Vec<Handle> {
    let mut chain = Vec::new();
    let mut current = get_parent_node(node);
    while let Some(parent) = current {
        current = get_parent_node(&parent);
        if is_element(&parent) {
            chain.push(parent);
        }
    }
    chain
}
