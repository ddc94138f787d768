//! Attribute-tree-gated views over host objects.
//!
//! A root proxy wraps a [`RootTarget`] and the allow-tree from its spec.
//! Attribute reads walk the tree: callable leaves wrap the host function
//! and freeze its return, value leaves freeze the host value, subtrees
//! produce nested proxies. Writes, iteration, and reflection do not exist —
//! the proxy exposes nothing but gated reads.

use std::collections::HashMap;
use std::sync::Arc;

use cordon_core::roots::{AllowNode, AllowTree};
use serde_json::Value as Json;

use crate::value::Value;

pub type RootFunc = Arc<dyn Fn(&[Json]) -> Result<Json, String> + Send + Sync>;

/// One member of a host object as seen through a proxy.
#[derive(Clone)]
pub enum RootMember {
    Callable(RootFunc),
    Value(Json),
    Object(Arc<dyn RootTarget>),
}

/// A host object whose members can be selectively exposed.
pub trait RootTarget: Send + Sync {
    fn member(&self, name: &str) -> Option<RootMember>;
}

/// Table-backed target, the common way to assemble a root from host
/// functions and constants.
#[derive(Default)]
pub struct TableRoot {
    members: HashMap<String, RootMember>,
}

impl TableRoot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&[Json]) -> Result<Json, String> + Send + Sync + 'static,
    {
        self.members
            .insert(name.into(), RootMember::Callable(Arc::new(f)));
    }

    pub fn insert_value(&mut self, name: impl Into<String>, value: Json) {
        self.members.insert(name.into(), RootMember::Value(value));
    }

    pub fn insert_object(&mut self, name: impl Into<String>, object: Arc<dyn RootTarget>) {
        self.members.insert(name.into(), RootMember::Object(object));
    }
}

impl RootTarget for TableRoot {
    fn member(&self, name: &str) -> Option<RootMember> {
        self.members.get(name).cloned()
    }
}

/// A callable reached through a proxy; its return value is frozen before
/// user code sees it.
pub struct RootCallable {
    name: String,
    func: RootFunc,
}

impl RootCallable {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call(&self, args: &[Json]) -> Result<Value, String> {
        let ret = (self.func)(args)?;
        Ok(Value::frozen_from_json(&ret))
    }
}

/// Read-only, allow-tree-gated view over a root target.
pub struct RootProxy {
    name: String,
    target: Arc<dyn RootTarget>,
    allow: AllowTree,
}

impl RootProxy {
    pub fn new(name: impl Into<String>, target: Arc<dyn RootTarget>, allow: AllowTree) -> Self {
        Self {
            name: name.into(),
            target,
            allow,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolve one attribute according to the allow-tree.
    pub fn get_attr(&self, item: &str) -> Result<Value, String> {
        let Some(node) = self.allow.get(item) else {
            return Err(format!("{}.{item} is not allowed", self.name));
        };
        let member = self
            .target
            .member(item)
            .ok_or_else(|| format!("{}.{item} is not allowed", self.name))?;
        match node {
            AllowNode::Tree(subtree) => {
                if node.is_value_leaf() {
                    return match member {
                        RootMember::Value(v) => Ok(Value::frozen_from_json(&v)),
                        _ => Err(format!("{}.{item} is not a value", self.name)),
                    };
                }
                match member {
                    RootMember::Object(target) => Ok(Value::Root(std::rc::Rc::new(RootProxy {
                        name: format!("{}.{item}", self.name),
                        target,
                        allow: subtree.clone(),
                    }))),
                    _ => Err(format!("{}.{item} is not allowed", self.name)),
                }
            }
            AllowNode::Leaf(true) => match member {
                RootMember::Callable(func) => {
                    Ok(Value::RootFn(std::rc::Rc::new(RootCallable {
                        name: format!("{}.{item}", self.name),
                        func,
                    })))
                }
                _ => Err(format!("{}.{item} is not callable", self.name)),
            },
            AllowNode::Leaf(false) => Err(format!("{}.{item} is not allowed", self.name)),
        }
    }
}
