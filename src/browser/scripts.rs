//! In-page scripts shared by the Chrome backend.
//!
//! Every script runs against a registry installed on first use. The
//! registry hands out stable numeric ids for elements (held weakly, so the
//! page stays free to discard them) and records which parents had their
//! child lists changed since the last drain.

use crate::errors::{Result, SweepError};
use crate::types::NodeId;
use headless_chrome::Tab;
use serde::de::DeserializeOwned;
use std::sync::Arc;

const REGISTRY: &str = r#"(window.__dmsweeper || (window.__dmsweeper = (() => {
    const refs = new Map();
    const ids = new WeakMap();
    const pending = new Set();
    let next = 1;
    const registry = {
        idOf(node) {
            let id = ids.get(node);
            if (id === undefined) {
                id = next++;
                ids.set(node, id);
                refs.set(id, new WeakRef(node));
            }
            return id;
        },
        get(id) {
            const ref = refs.get(id);
            const node = ref && ref.deref();
            if (!node) {
                refs.delete(id);
                return null;
            }
            return node;
        },
        live(id) {
            const node = registry.get(id);
            return node && node.isConnected ? node : null;
        },
        drain() {
            for (const [id, ref] of refs) {
                if (!ref.deref()) refs.delete(id);
            }
            const out = Array.from(pending);
            pending.clear();
            return out;
        },
    };
    new MutationObserver((mutations) => {
        for (const m of mutations) {
            if (m.type === 'childList') pending.add(registry.idOf(m.target));
        }
    }).observe(document.body, { childList: true, subtree: true });
    return registry;
})()))"#;

/// Wraps `body` so it runs with the registry bound to `r` and hands its
/// return value back as a JSON string.
pub(crate) fn wrap(body: &str) -> String {
    format!(
        "(() => {{ const r = {}; const out = (() => {{ {} }})(); return JSON.stringify(out === undefined ? null : out); }})()",
        REGISTRY, body
    )
}

/// Body that evaluates `expr` with the element `node` bound to `n`, or
/// yields `null` when the element is gone.
pub(crate) fn on_node(node: NodeId, expr: &str) -> String {
    format!(
        "const n = r.live({}); if (!n) return null; return ({});",
        node.0, expr
    )
}

/// Expression for the element a query is scoped to.
pub(crate) fn scope_expr(scope: Option<NodeId>) -> String {
    match scope {
        Some(node) => format!("r.live({})", node.0),
        None => "document.body".to_string(),
    }
}

pub(crate) fn evaluate<T: DeserializeOwned>(tab: &Tab, body: &str) -> Result<T> {
    let result = tab
        .evaluate(&wrap(body), false)
        .map_err(|e| SweepError::JavaScriptFailed(e.to_string()))?;
    let raw = result
        .value
        .as_ref()
        .and_then(|v| v.as_str())
        .ok_or_else(|| SweepError::JavaScriptFailed("script produced no value".to_string()))?;
    Ok(serde_json::from_str(raw)?)
}

/// Evaluates `body` on the blocking pool; the DevTools round trip is
/// synchronous.
pub(crate) async fn evaluate_off_runtime<T>(tab: Arc<Tab>, body: String) -> Result<T>
where
    T: DeserializeOwned + Send + 'static,
{
    off_runtime(move || evaluate(&tab, &body)).await
}

pub(crate) async fn off_runtime<T, F>(call: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| SweepError::JavaScriptFailed(format!("browser call did not complete: {}", e)))?
}
