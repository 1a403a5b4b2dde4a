//! 可观察的页面文档
//!
//! 所有变更都经由 [`PageDocument`] 进行，并以 [`PageEvent`] 广播给订阅者，
//! 对应浏览器中的 MutationObserver 以及页面内部的导航事件。

use std::cell::{Cell, RefCell};
use std::io;
use std::rc::Rc;

use html5ever::tendril::StrTendril;
use markup5ever_rcdom::{Handle, Node, NodeData, RcDom};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::debug;

use super::{
    descendant_elements, elements_by_tag, find_body, get_node_attr, get_parent_node, html_to_dom,
    is_text, set_node_attr, text_content,
};

/// 页面事件
#[derive(Debug, Clone)]
pub enum PageEvent {
    /// 子节点增删
    ChildList {
        target: Handle,
        added: Vec<Handle>,
        removed: Vec<Handle>,
    },
    /// 文本节点内容变化
    CharacterData { target: Handle },
    /// 属性变化
    Attribute { target: Handle, name: String },
    /// 单页应用内部切换区块
    SectionChanged { section_id: String },
    /// 地址变化
    UrlChanged { url: String },
    /// 页面可见性变化
    VisibilityChanged { visible: bool },
}

impl PageEvent {
    /// 新增节点中是否带有可见文本
    pub fn adds_text(&self) -> bool {
        match self {
            PageEvent::ChildList { added, .. } => added
                .iter()
                .any(|node| !text_content(node).trim().is_empty()),
            _ => false,
        }
    }
}

/// 页面文档
pub struct PageDocument {
    dom: RcDom,
    url: RefCell<String>,
    visible: Cell<bool>,
    subscribers: RefCell<Vec<UnboundedSender<PageEvent>>>,
}

impl PageDocument {
    pub fn parse(html: &str, url: &str) -> io::Result<Self> {
        Self::from_bytes(html.as_bytes(), "utf-8", url)
    }

    pub fn from_bytes(data: &[u8], encoding: &str, url: &str) -> io::Result<Self> {
        Ok(Self {
            dom: html_to_dom(data, encoding)?,
            url: RefCell::new(url.to_string()),
            visible: Cell::new(true),
            subscribers: RefCell::new(Vec::new()),
        })
    }

    pub fn document(&self) -> Handle {
        self.dom.document.clone()
    }

    pub fn body(&self) -> Handle {
        find_body(&self.dom.document)
    }

    pub fn url(&self) -> String {
        self.url.borrow().clone()
    }

    pub fn hostname(&self) -> Option<String> {
        url::Url::parse(&self.url.borrow())
            .ok()
            .and_then(|parsed| parsed.host_str().map(str::to_string))
    }

    pub fn is_visible(&self) -> bool {
        self.visible.get()
    }

    /// 订阅页面事件
    pub fn subscribe(&self) -> UnboundedReceiver<PageEvent> {
        let (tx, rx) = unbounded_channel();
        self.subscribers.borrow_mut().push(tx);
        rx
    }

    pub fn elements_by_tag(&self, tag: &str) -> Vec<Handle> {
        elements_by_tag(&self.dom.document, tag)
    }

    pub fn element_by_id(&self, id: &str) -> Option<Handle> {
        descendant_elements(&self.dom.document)
            .into_iter()
            .find(|node| get_node_attr(node, "id").as_deref() == Some(id))
    }

    /// 设置元素文本
    ///
    /// 元素只有一个文本子节点时原地修改（characterData），否则整体替换子节点（childList）。
    pub fn set_text(&self, node: &Handle, text: &str) {
        if let NodeData::Text { contents } = &node.data {
            *contents.borrow_mut() = StrTendril::from_slice(text);
            self.publish(PageEvent::CharacterData {
                target: node.clone(),
            });
            return;
        }

        let single_text = {
            let children = node.children.borrow();
            match children.as_slice() {
                [only] if is_text(only) => Some(only.clone()),
                _ => None,
            }
        };

        if let Some(text_node) = single_text {
            if let NodeData::Text { contents } = &text_node.data {
                *contents.borrow_mut() = StrTendril::from_slice(text);
            }
            self.publish(PageEvent::CharacterData { target: text_node });
            return;
        }

        let new_text = Node::new(NodeData::Text {
            contents: RefCell::new(StrTendril::from_slice(text)),
        });
        new_text.parent.set(Some(Rc::downgrade(node)));
        let removed = std::mem::replace(&mut *node.children.borrow_mut(), vec![new_text.clone()]);
        for child in &removed {
            child.parent.set(None);
        }

        self.publish(PageEvent::ChildList {
            target: node.clone(),
            added: vec![new_text],
            removed,
        });
    }

    pub fn set_attribute(&self, node: &Handle, name: &str, value: Option<&str>) {
        set_node_attr(node, name, value);
        self.publish(PageEvent::Attribute {
            target: node.clone(),
            name: name.to_string(),
        });
    }

    /// 解析 HTML 片段并追加到 `parent` 末尾，返回新增的顶层节点
    pub fn append_html(&self, parent: &Handle, html: &str) -> io::Result<Vec<Handle>> {
        let wrapper = format!("<!DOCTYPE html><html><body>{}</body></html>", html);
        let fragment = html_to_dom(wrapper.as_bytes(), "utf-8")?;
        let fragment_body = find_body(&fragment.document);

        let added: Vec<Handle> = fragment_body.children.borrow_mut().drain(..).collect();
        {
            let mut children = parent.children.borrow_mut();
            for node in &added {
                node.parent.set(Some(Rc::downgrade(parent)));
                children.push(node.clone());
            }
        }

        self.publish(PageEvent::ChildList {
            target: parent.clone(),
            added: added.clone(),
            removed: Vec::new(),
        });
        Ok(added)
    }

    /// 从树中移除节点
    pub fn remove(&self, node: &Handle) -> bool {
        let Some(parent) = get_parent_node(node) else {
            return false;
        };

        parent
            .children
            .borrow_mut()
            .retain(|child| !Rc::ptr_eq(child, node));
        node.parent.set(None);

        self.publish(PageEvent::ChildList {
            target: parent,
            added: Vec::new(),
            removed: vec![node.clone()],
        });
        true
    }

    pub fn navigate(&self, url: &str) {
        *self.url.borrow_mut() = url.to_string();
        self.publish(PageEvent::UrlChanged {
            url: url.to_string(),
        });
    }

    /// 通知内部区块切换（导航进行中）
    pub fn announce_section_change(&self, section_id: &str) {
        self.publish(PageEvent::SectionChanged {
            section_id: section_id.to_string(),
        });
    }

    pub fn set_visible(&self, visible: bool) {
        self.visible.set(visible);
        self.publish(PageEvent::VisibilityChanged { visible });
    }

    fn publish(&self, event: PageEvent) {
        let mut subscribers = self.subscribers.borrow_mut();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        debug!("页面事件已广播，订阅者 {} 个", subscribers.len());
    }
}
