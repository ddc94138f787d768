use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Recursive attribute allowlist for a root object.
///
/// A leaf `true` marks a callable, a subtree containing `value: true` marks
/// a frozen-value leaf, and any other subtree gates a nested object.
pub type AllowTree = BTreeMap<String, AllowNode>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AllowNode {
    Leaf(bool),
    Tree(AllowTree),
}

impl AllowNode {
    /// True when this subtree is the `{value: true}` frozen-value marker.
    pub fn is_value_leaf(&self) -> bool {
        matches!(self, AllowNode::Tree(t) if matches!(t.get("value"), Some(AllowNode::Leaf(true))))
    }
}

/// Specification for a root object injected into sandbox globals.
///
/// `target` names an entry in the worker's root registry (the serialisable
/// analog of handing over a live object); `name` is the identifier user
/// code sees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootSpec {
    pub name: String,
    pub target: String,
    pub allow_tree: AllowTree,
}

impl RootSpec {
    pub fn new(name: impl Into<String>, target: impl Into<String>, allow_tree: AllowTree) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            allow_tree,
        }
    }

    /// Top-level attribute names, merged into the policy attr allowlist.
    pub fn attr_allow(&self) -> BTreeSet<String> {
        self.allow_tree.keys().cloned().collect()
    }
}

/// Build an allow-tree from leaf markers, e.g.
/// `allow_tree([("sin", leaf()), ("pi", value_leaf())])`.
pub fn allow_tree<I>(entries: I) -> AllowTree
where
    I: IntoIterator<Item = (&'static str, AllowNode)>,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Callable leaf marker.
pub fn leaf() -> AllowNode {
    AllowNode::Leaf(true)
}

/// Frozen-value leaf marker (`{value: true}`).
pub fn value_leaf() -> AllowNode {
    AllowNode::Tree(BTreeMap::from([(
        "value".to_string(),
        AllowNode::Leaf(true),
    )]))
}
