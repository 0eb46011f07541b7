use crate::error::PatchError;
use crate::events::EventManager;
use crate::listeners::{Listeners, Subscription};
use crate::protocol::{PatchOperation, TreePatch, UpdateMessage};
use crate::tree::{Component, ComponentTree};
use serde_json::{Map, Value};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, warn};

/// What the renderer is told after every successful mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Tree {
        target_id: String,
        operation: PatchOperation,
        /// Ids that left the tree with this patch.
        retired: Vec<String>,
    },
    State {
        keys: Vec<String>,
    },
    Render {
        root_id: String,
        retired: Vec<String>,
    },
}

/// Sole writer of the component tree and the flat app-state map.
#[derive(Default)]
pub struct StateManager {
    tree: RefCell<ComponentTree>,
    app_state: RefCell<Map<String, Value>>,
    changes: Listeners<Change>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(self: &Rc<Self>, events: &EventManager) -> Subscription {
        let state = Rc::downgrade(self);
        events.on_update(move |message| {
            if let Some(state) = state.upgrade() {
                state.apply_update(message);
            }
        })
    }

    pub fn on_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Change) + 'static,
    {
        self.changes.add(handler)
    }

    /// Applies the directives this manager owns and ignores the rest.
    /// Returns whether anything changed.
    pub fn apply_update(&self, message: &UpdateMessage) -> bool {
        match message {
            UpdateMessage::Update(patch) => self.apply_patch(patch),
            UpdateMessage::StateUpdate { state } => {
                self.merge_state(state);
                true
            }
            UpdateMessage::PageRender { component } => self.render(component.clone()),
            _ => false,
        }
    }

    pub fn apply_patch(&self, patch: &TreePatch) -> bool {
        let result = self.tree.borrow_mut().apply(patch);

        match result {
            Ok(retired) => {
                self.changes.emit(&Change::Tree {
                    target_id: patch.target_id().to_string(),
                    operation: patch.operation(),
                    retired,
                });
                true
            }
            Err(PatchError::TargetNotFound(target_id)) => {
                warn!(
                    target_id = %target_id,
                    operation = patch.operation().as_str(),
                    "update target not found; ignoring"
                );
                false
            }
            Err(err) => {
                warn!(
                    target_id = patch.target_id(),
                    operation = patch.operation().as_str(),
                    error = %err,
                    "rejected tree patch"
                );
                false
            }
        }
    }

    /// Replaces the whole tree with a fresh snapshot.
    pub fn render(&self, root: Component) -> bool {
        let root_id = root.id.clone();
        let result = self.tree.borrow_mut().render(root);

        match result {
            Ok(retired) => {
                debug!(root_id = %root_id, retired = retired.len(), "page rendered");
                self.changes.emit(&Change::Render { root_id, retired });
                true
            }
            Err(err) => {
                warn!(root_id = %root_id, error = %err, "rejected page render");
                false
            }
        }
    }

    /// Shallow merge into app state.
    pub fn merge_state(&self, state: &Map<String, Value>) {
        if state.is_empty() {
            return;
        }

        {
            let mut app_state = self.app_state.borrow_mut();
            for (key, value) in state {
                app_state.insert(key.clone(), value.clone());
            }
        }

        self.changes.emit(&Change::State {
            keys: state.keys().cloned().collect(),
        });
    }

    pub fn set_state(&self, key: &str, value: Value) {
        self.app_state.borrow_mut().insert(key.to_string(), value);
        self.changes.emit(&Change::State {
            keys: vec![key.to_string()],
        });
    }

    /// Drops the tree and app state, returning the ids that were mounted.
    /// Used on unmount; no change is emitted.
    pub fn clear(&self) -> Vec<String> {
        self.app_state.borrow_mut().clear();
        self.tree.borrow_mut().clear()
    }

    pub fn with_tree<R>(&self, read: impl FnOnce(&ComponentTree) -> R) -> R {
        read(&self.tree.borrow())
    }

    pub fn node(&self, id: &str) -> Option<Component> {
        self.tree.borrow().find(id).cloned()
    }

    pub fn snapshot(&self) -> Option<Component> {
        self.tree.borrow().root().cloned()
    }

    pub fn app_state(&self) -> Map<String, Value> {
        self.app_state.borrow().clone()
    }

    pub fn state_value(&self, key: &str) -> Option<Value> {
        self.app_state.borrow().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Nodes;
    use serde_json::json;
    use std::cell::Cell;

    fn page() -> Component {
        Component::new("Page", "root").with_children(vec![
            Component::new("Text", "txt")
                .with_prop("value", json!("hi"))
                .into(),
        ])
    }

    fn recorded(state: &StateManager) -> Rc<RefCell<Vec<Change>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let _subscription = state.on_change(move |change| sink.borrow_mut().push(change.clone()));
        seen
    }

    fn update_props(target: &str, value: Value) -> UpdateMessage {
        let mut props = Map::new();
        props.insert("value".to_string(), value);
        UpdateMessage::Update(TreePatch::UpdateProps {
            target_id: target.to_string(),
            props,
        })
    }

    #[test]
    fn update_props_notifies_with_target_and_operation() {
        let state = StateManager::new();
        state.render(page());
        let seen = recorded(&state);

        assert!(state.apply_update(&update_props("txt", json!("bye"))));

        assert_eq!(state.node("txt").expect("txt").props["value"], "bye");
        assert_eq!(
            *seen.borrow(),
            vec![Change::Tree {
                target_id: "txt".to_string(),
                operation: PatchOperation::UpdateProps,
                retired: Vec::new(),
            }]
        );
    }

    #[test]
    fn missing_target_is_a_silent_no_op() {
        let state = StateManager::new();
        state.render(page());
        let before = state.snapshot();
        let seen = recorded(&state);

        assert!(!state.apply_update(&update_props("ghost", json!("x"))));
        assert_eq!(state.snapshot(), before);
        assert!(seen.borrow().is_empty());
    }

    #[test]
    fn patch_before_first_render_is_ignored() {
        let state = StateManager::new();
        assert!(!state.apply_update(&update_props("txt", json!("x"))));
        assert!(state.snapshot().is_none());
    }

    #[test]
    fn state_update_merges_shallowly() {
        let state = StateManager::new();
        state.set_state("user", json!({"name": "ada"}));
        state.set_state("count", json!(1));

        let mut incoming = Map::new();
        incoming.insert("count".to_string(), json!(2));
        state.apply_update(&UpdateMessage::StateUpdate { state: incoming });

        assert_eq!(state.state_value("count"), Some(json!(2)));
        assert_eq!(state.state_value("user"), Some(json!({"name": "ada"})));
    }

    #[test]
    fn page_render_reports_retired_ids() {
        let state = StateManager::new();
        state.render(page());
        let seen = recorded(&state);

        state.apply_update(&UpdateMessage::PageRender {
            component: Component::new("Page", "root"),
        });

        assert_eq!(
            *seen.borrow(),
            vec![Change::Render {
                root_id: "root".to_string(),
                retired: vec!["txt".to_string()],
            }]
        );
    }

    #[test]
    fn unrelated_directives_are_ignored() {
        let state = StateManager::new();
        assert!(!state.apply_update(&UpdateMessage::Refresh));
    }

    #[test]
    fn clear_returns_mounted_ids() {
        let state = StateManager::new();
        state.render(page());
        state.set_state("k", json!(1));

        let mut cleared = state.clear();
        cleared.sort();

        assert_eq!(cleared, vec!["root", "txt"]);
        assert!(state.app_state().is_empty());
        assert!(state.with_tree(ComponentTree::is_empty));
    }

    #[test]
    fn change_handler_may_apply_a_follow_up_patch() {
        let state = Rc::new(StateManager::new());
        state.render(page());
        let fired = Rc::new(Cell::new(false));

        let weak = Rc::downgrade(&state);
        let once = fired.clone();
        let _subscription = state.on_change(move |change| {
            let Some(state) = weak.upgrade() else { return };
            if matches!(change, Change::Tree { target_id, .. } if target_id == "txt")
                && !once.replace(true)
            {
                state.apply_patch(&TreePatch::Append {
                    target_id: "root".to_string(),
                    component: Nodes::One(Component::new("Text", "echo").into()),
                });
            }
        });

        state.apply_update(&update_props("txt", json!("bye")));

        assert!(fired.get());
        assert!(state.node("echo").is_some());
    }
}
