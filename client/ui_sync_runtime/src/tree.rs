use crate::error::PatchError;
use crate::protocol::TreePatch;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// One node of the server-owned UI tree. Props stay an opaque ordered map;
/// their shape is the renderer's business.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    #[serde(default)]
    pub props: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<Child>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Child {
    Node(Component),
    Text(String),
}

impl Component {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            props: Map::new(),
            children: None,
        }
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: Value) -> Self {
        self.props.insert(key.into(), value);
        self
    }

    pub fn with_children(mut self, children: Vec<Child>) -> Self {
        self.children = Some(children);
        self
    }

    pub fn find(&self, id: &str) -> Option<&Component> {
        if self.id == id {
            return Some(self);
        }

        self.children.as_ref()?.iter().find_map(|child| match child {
            Child::Node(node) => node.find(id),
            Child::Text(_) => None,
        })
    }

    /// Ids of the immediate component children, in order.
    pub fn child_ids(&self) -> Vec<&str> {
        self.children
            .iter()
            .flatten()
            .filter_map(|child| match child {
                Child::Node(node) => Some(node.id.as_str()),
                Child::Text(_) => None,
            })
            .collect()
    }

    fn collect_ids(&self, out: &mut Vec<String>) {
        out.push(self.id.clone());
        collect_child_ids(self.children.iter().flatten(), out);
    }
}

impl From<Component> for Child {
    fn from(component: Component) -> Self {
        Self::Node(component)
    }
}

fn collect_child_ids<'a>(children: impl Iterator<Item = &'a Child>, out: &mut Vec<String>) {
    for child in children {
        if let Child::Node(node) = child {
            node.collect_ids(out);
        }
    }
}

fn find_mut<'a>(node: &'a mut Component, id: &str) -> Option<&'a mut Component> {
    if node.id == id {
        return Some(node);
    }

    node.children
        .as_mut()?
        .iter_mut()
        .find_map(|child| match child {
            Child::Node(node) => find_mut(node, id),
            Child::Text(_) => None,
        })
}

fn detach(node: &mut Component, id: &str) -> Option<Component> {
    let children = node.children.as_mut()?;

    if let Some(index) = children
        .iter()
        .position(|child| matches!(child, Child::Node(node) if node.id == id))
    {
        return match children.remove(index) {
            Child::Node(node) => Some(node),
            Child::Text(_) => None,
        };
    }

    children.iter_mut().find_map(|child| match child {
        Child::Node(node) => detach(node, id),
        Child::Text(_) => None,
    })
}

/// The canonical tree plus an index of every id in it.
///
/// Each patch is validated in full before anything is touched, so a rejected
/// patch leaves the tree exactly as it was.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentTree {
    root: Option<Component>,
    ids: HashSet<String>,
}

impl ComponentTree {
    pub fn new(root: Component) -> Result<Self, PatchError> {
        let mut tree = Self::default();
        tree.render(root)?;
        Ok(tree)
    }

    pub fn root(&self) -> Option<&Component> {
        self.root.as_ref()
    }

    pub fn find(&self, id: &str) -> Option<&Component> {
        if !self.ids.contains(id) {
            return None;
        }
        self.root.as_ref()?.find(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Number of components in the tree.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn clear(&mut self) -> Vec<String> {
        self.root = None;
        self.ids.drain().collect()
    }

    /// Swaps in a whole new tree. Returns the ids that did not survive.
    pub fn render(&mut self, root: Component) -> Result<Vec<String>, PatchError> {
        let mut incoming = Vec::new();
        root.collect_ids(&mut incoming);
        let ids = unique_ids(&incoming)?;

        let retired = self
            .ids
            .iter()
            .filter(|id| !ids.contains(*id))
            .cloned()
            .collect();

        self.root = Some(root);
        self.ids = ids;
        Ok(retired)
    }

    /// Applies one patch and returns the ids it retired.
    pub fn apply(&mut self, patch: &TreePatch) -> Result<Vec<String>, PatchError> {
        let target_id = patch.target_id();
        let Some(root) = self.root.as_ref() else {
            return Err(PatchError::NoTree);
        };
        let target = root
            .find(target_id)
            .ok_or_else(|| PatchError::TargetNotFound(target_id.to_string()))?;

        match patch {
            TreePatch::Replace { component, .. } => {
                let mut outgoing = Vec::new();
                target.collect_ids(&mut outgoing);
                let mut incoming = Vec::new();
                component.collect_ids(&mut incoming);
                self.check_insert(&incoming, &outgoing)?;

                let is_root = root.id == target_id;
                if is_root {
                    self.root = Some(component.clone());
                } else if let Some(node) = self.node_mut(target_id) {
                    *node = component.clone();
                }

                Ok(self.swap_ids(outgoing, incoming))
            }
            TreePatch::Append { component, .. } | TreePatch::Prepend { component, .. } => {
                let children = component.clone().into_vec();
                let mut incoming = Vec::new();
                collect_child_ids(children.iter(), &mut incoming);
                self.check_insert(&incoming, &[])?;

                if let Some(node) = self.node_mut(target_id) {
                    let existing = node.children.get_or_insert_with(Vec::new);
                    if matches!(patch, TreePatch::Prepend { .. }) {
                        let tail = std::mem::replace(existing, children);
                        existing.extend(tail);
                    } else {
                        existing.extend(children);
                    }
                }

                Ok(self.swap_ids(Vec::new(), incoming))
            }
            TreePatch::Remove { .. } => {
                let mut outgoing = Vec::new();
                target.collect_ids(&mut outgoing);

                if root.id == target_id {
                    self.root = None;
                } else if let Some(root) = self.root.as_mut() {
                    detach(root, target_id);
                }

                Ok(self.swap_ids(outgoing, Vec::new()))
            }
            TreePatch::UpdateProps { props, .. } => {
                if let Some(node) = self.node_mut(target_id) {
                    for (key, value) in props {
                        node.props.insert(key.clone(), value.clone());
                    }
                }
                Ok(Vec::new())
            }
            TreePatch::UpdateChildren { children, .. } => {
                let mut outgoing = Vec::new();
                collect_child_ids(target.children.iter().flatten(), &mut outgoing);
                let mut incoming = Vec::new();
                collect_child_ids(children.iter(), &mut incoming);
                self.check_insert(&incoming, &outgoing)?;

                if let Some(node) = self.node_mut(target_id) {
                    node.children = Some(children.clone());
                }

                Ok(self.swap_ids(outgoing, incoming))
            }
            TreePatch::AppendProp { prop, value, .. } => {
                if target.props.get(prop).is_some_and(|current| !current.is_array()) {
                    return Err(PatchError::NotAList {
                        target_id: target_id.to_string(),
                        prop: prop.clone(),
                    });
                }

                if let Some(node) = self.node_mut(target_id) {
                    match node.props.get_mut(prop) {
                        Some(Value::Array(items)) => items.push(value.clone()),
                        _ => {
                            node.props
                                .insert(prop.clone(), Value::Array(vec![value.clone()]));
                        }
                    }
                }
                Ok(Vec::new())
            }
        }
    }

    fn node_mut(&mut self, id: &str) -> Option<&mut Component> {
        find_mut(self.root.as_mut()?, id)
    }

    /// Rejects ids that repeat within `incoming` or collide with ids that stay
    /// in the tree after `outgoing` leaves.
    fn check_insert(&self, incoming: &[String], outgoing: &[String]) -> Result<(), PatchError> {
        let mut seen = HashSet::with_capacity(incoming.len());

        for id in incoming {
            let collides = self.ids.contains(id) && !outgoing.contains(id);
            if collides || !seen.insert(id.as_str()) {
                return Err(PatchError::DuplicateId(id.clone()));
            }
        }

        Ok(())
    }

    fn swap_ids(&mut self, outgoing: Vec<String>, incoming: Vec<String>) -> Vec<String> {
        for id in &outgoing {
            self.ids.remove(id);
        }

        let retired = outgoing
            .into_iter()
            .filter(|id| !incoming.contains(id))
            .collect();

        self.ids.extend(incoming);
        retired
    }
}

fn unique_ids(ids: &[String]) -> Result<HashSet<String>, PatchError> {
    let mut set = HashSet::with_capacity(ids.len());
    for id in ids {
        if !set.insert(id.clone()) {
            return Err(PatchError::DuplicateId(id.clone()));
        }
    }
    Ok(set)
}
