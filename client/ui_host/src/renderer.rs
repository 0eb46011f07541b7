use projection_ui_sync_runtime::{Change, PageEvent, Renderer, StateManager};
use tracing::info;

/// Headless renderer: reports every change and page event to the log.
pub struct LogRenderer;

impl Renderer for LogRenderer {
    fn on_change(&self, change: &Change, state: &StateManager) {
        match change {
            Change::Tree {
                target_id,
                operation,
                retired,
            } => {
                let props = state
                    .node(target_id)
                    .map(|node| serde_json::Value::Object(node.props).to_string());
                info!(
                    target_id = %target_id,
                    operation = operation.as_str(),
                    retired = retired.len(),
                    props = props.as_deref().unwrap_or("-"),
                    "tree patched"
                );
            }
            Change::State { keys } => info!(keys = ?keys, "app state updated"),
            Change::Render { root_id, .. } => {
                let nodes = state.with_tree(|tree| tree.len());
                info!(root_id = %root_id, nodes, "page rendered");
            }
        }
    }

    fn on_page_event(&self, event: &PageEvent) {
        match event {
            PageEvent::Toast(toast) => info!(message = %toast.message, "toast"),
            PageEvent::Navigate { path, replace } => info!(path = %path, replace, "navigate"),
            other => info!(event = other.name(), detail = ?other, "page event"),
        }
    }
}
