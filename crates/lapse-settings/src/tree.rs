use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::value::SettingValue;

/// Leaf kinds a camera can expose. Containers carry no kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingKind {
    Text,
    Range,
    Toggle,
    Choice,
    Date,
    Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RangeBounds {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

/// One node of the hardware configuration tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigNode {
    pub name: String,
    pub label: String,
    /// `None` for structural containers (window/section).
    pub kind: Option<SettingKind>,
    pub value: Option<SettingValue>,
    pub choices: Option<Vec<String>>,
    pub bounds: Option<RangeBounds>,
    pub readonly: bool,
    pub children: Vec<ConfigNode>,
    changed: bool,
}

impl ConfigNode {
    pub fn container(name: impl Into<String>, children: Vec<ConfigNode>) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            kind: None,
            value: None,
            choices: None,
            bounds: None,
            readonly: false,
            children,
            changed: false,
        }
    }

    pub fn leaf(name: impl Into<String>, kind: SettingKind) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            kind: Some(kind),
            value: None,
            choices: None,
            bounds: None,
            readonly: false,
            children: Vec::new(),
            changed: false,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_value(mut self, value: SettingValue) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.choices = Some(choices.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_bounds(mut self, min: f64, max: f64, step: f64) -> Self {
        self.bounds = Some(RangeBounds { min, max, step });
        self
    }

    pub fn read_only(mut self) -> Self {
        self.readonly = true;
        self
    }

    pub fn is_container(&self) -> bool {
        self.kind.is_none()
    }

    /// True once `set_value` was called since the tree was read.
    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn set_value(&mut self, value: SettingValue) {
        self.value = Some(value);
        self.changed = true;
    }

    /// Finds a node by dotted path. The first segment names `self`.
    pub fn find(&self, path: &str) -> Option<&ConfigNode> {
        let mut parts = path.split('.');
        if parts.next()? != self.name {
            return None;
        }
        let mut node = self;
        for part in parts {
            node = node.children.iter().find(|c| c.name == part)?;
        }
        Some(node)
    }

    pub fn find_mut(&mut self, path: &str) -> Option<&mut ConfigNode> {
        let mut parts = path.split('.');
        if parts.next()? != self.name {
            return None;
        }
        let mut node = self;
        for part in parts {
            node = node.children.iter_mut().find(|c| c.name == part)?;
        }
        Some(node)
    }

    /// Paths and values of every leaf touched by `set_value`.
    pub fn changed_leaves(&self) -> Vec<(String, &SettingValue)> {
        flatten(self)
            .into_iter()
            .filter(|(_, n)| n.changed)
            .filter_map(|(p, n)| n.value.as_ref().map(|v| (p, v)))
            .collect()
    }
}

/// Read-back view of one leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingEntry {
    pub path: String,
    pub label: String,
    pub kind: SettingKind,
    pub current: Option<SettingValue>,
    pub choices: Option<Vec<String>>,
    pub bounds: Option<RangeBounds>,
    pub readonly: bool,
}

impl SettingEntry {
    pub(crate) fn from_node(path: String, node: &ConfigNode) -> Option<Self> {
        Some(Self {
            path,
            label: node.label.clone(),
            kind: node.kind?,
            current: node.value.clone(),
            choices: node.choices.clone(),
            bounds: node.bounds,
            readonly: node.readonly,
        })
    }
}

/// Every node keyed by its dotted path, root included.
pub fn flatten(root: &ConfigNode) -> BTreeMap<String, &ConfigNode> {
    let mut out = BTreeMap::new();
    walk(root, "", &mut out);
    out
}

fn walk<'a>(node: &'a ConfigNode, prefix: &str, out: &mut BTreeMap<String, &'a ConfigNode>) {
    let path = if prefix.is_empty() {
        node.name.clone()
    } else {
        format!("{}.{}", prefix, node.name)
    };
    for child in &node.children {
        walk(child, &path, out);
    }
    out.insert(path, node);
}
