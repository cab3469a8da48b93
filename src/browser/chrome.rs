use crate::browser::mutation_feed::MutationFeed;
use crate::browser::scripts::{self, on_node, scope_expr};
use crate::core::{BrowserConfig, Document, MutationRecord};
use crate::dom::Locator;
use crate::errors::{Result, SweepError};
use crate::types::{ElementRect, NodeId, ScrollMetrics};
use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::de::DeserializeOwned;
use serde_json::json;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument};

const VISIBLE: &str = "(typeof n.checkVisibility === 'function') \
    ? n.checkVisibility({ opacityProperty: true, visibilityProperty: true, contentVisibilityAuto: true }) \
    : !!(n.offsetWidth || n.offsetHeight || n.getClientRects().length)";

const RECT: &str = "(() => { const b = n.getBoundingClientRect(); \
    return { x: b.x, y: b.y, width: b.width, height: b.height }; })()";

const METRICS: &str =
    "{ scroll_top: n.scrollTop, scroll_height: n.scrollHeight, client_height: n.clientHeight }";

const HOVER: &str = "(['mouseover', 'mouseenter', 'mousemove'].forEach((t) => \
    n.dispatchEvent(new MouseEvent(t, { bubbles: true, cancelable: true, view: window }))), true)";

/// [`Document`] backed by a live Chrome tab.
pub struct ChromeDocument {
    _browser: Browser,
    tab: Arc<Tab>,
    feed: MutationFeed,
    poll_interval: Duration,
}

impl ChromeDocument {
    /// Launches a browser, or attaches to one when a debugger URL is set,
    /// and opens a fresh tab.
    pub async fn launch(config: &BrowserConfig) -> Result<Self> {
        let browser = match &config.debugger_ws_url {
            Some(ws_url) => {
                info!(%ws_url, "attaching to running browser");
                Browser::connect(ws_url.clone())
                    .map_err(|e| SweepError::LaunchFailed(e.to_string()))?
            }
            None => launch(config)?,
        };

        let tab = browser
            .new_tab()
            .map_err(|e| SweepError::LaunchFailed(e.to_string()))?;
        tab.set_default_timeout(Duration::from_millis(config.navigation_timeout_ms));

        Ok(Self {
            _browser: browser,
            tab,
            feed: MutationFeed::new(),
            poll_interval: Duration::from_millis(config.feed_poll_interval_ms),
        })
    }

    /// Navigates to `url` and starts publishing change notifications.
    #[instrument(skip(self))]
    pub async fn open(&self, url: &str) -> Result<()> {
        let tab = self.tab.clone();
        let url = url.to_string();
        scripts::off_runtime(move || {
            tab.navigate_to(&url)
                .map_err(|e| SweepError::NavigationFailed(e.to_string()))?;
            tab.wait_until_navigated()
                .map_err(|e| SweepError::NavigationFailed(e.to_string()))?;
            Ok(())
        })
        .await?;

        let root: u64 = self.eval("return r.idOf(document.body);").await?;
        debug!(root, "page registry installed");
        self.feed.start(self.tab.clone(), self.poll_interval);
        Ok(())
    }

    pub fn url(&self) -> String {
        self.tab.get_url()
    }

    async fn eval<T: DeserializeOwned + Send + 'static>(&self, body: &str) -> Result<T> {
        scripts::evaluate_off_runtime(self.tab.clone(), body.to_string()).await
    }

    /// Evaluates `expr` on `node`; a detached node is reported stale.
    async fn on<T: DeserializeOwned + Send + 'static>(&self, node: NodeId, expr: &str) -> Result<T> {
        self.eval::<Option<T>>(&on_node(node, expr))
            .await?
            .ok_or(SweepError::StaleNode(node))
    }
}

/// Command-line switches for a launched browser.
fn launch_args(config: &BrowserConfig) -> Vec<String> {
    let mut args = vec![
        "--disable-dev-shm-usage".to_string(),
        format!(
            "--window-size={},{}",
            config.viewport.width, config.viewport.height
        ),
    ];
    if let Some(ua) = &config.user_agent {
        args.push(format!("--user-agent={}", ua));
    }
    if let Some(dir) = &config.user_data_dir {
        args.push(format!("--user-data-dir={}", dir.display()));
    }
    args.extend(config.args.iter().cloned());
    args
}

fn launch(config: &BrowserConfig) -> Result<Browser> {
    let args = launch_args(config);
    let launch_options = LaunchOptions::default_builder()
        .headless(config.headless)
        .args(args.iter().map(OsStr::new).collect())
        .build()
        .map_err(|e| SweepError::LaunchFailed(e.to_string()))?;
    Browser::new(launch_options).map_err(|e| SweepError::LaunchFailed(e.to_string()))
}

#[async_trait]
impl Document for ChromeDocument {
    async fn root(&self) -> Result<NodeId> {
        Ok(NodeId(self.eval("return r.idOf(document.body);").await?))
    }

    async fn query_all(&self, scope: Option<NodeId>, locator: &Locator) -> Result<Vec<NodeId>> {
        let body = format!(
            "const scope = {}; if (!scope) return null; \
             return Array.from(scope.querySelectorAll('*')).filter((n) => {}).map((n) => r.idOf(n));",
            scope_expr(scope),
            locator.to_js_predicate()
        );
        match (self.eval::<Option<Vec<u64>>>(&body).await?, scope) {
            (Some(ids), _) => Ok(ids.into_iter().map(NodeId).collect()),
            (None, Some(scope)) => Err(SweepError::StaleNode(scope)),
            (None, None) => Ok(Vec::new()),
        }
    }

    async fn contains(&self, node: NodeId) -> Result<bool> {
        self.eval(&format!(
            "const n = r.get({}); return !!n && n.isConnected;",
            node.0
        ))
        .await
    }

    async fn text(&self, node: NodeId) -> Result<String> {
        self.on(node, "n.textContent || ''").await
    }

    async fn is_visible(&self, node: NodeId) -> Result<bool> {
        self.on(node, VISIBLE).await
    }

    async fn bounding_rect(&self, node: NodeId) -> Result<Option<ElementRect>> {
        Ok(Some(self.on(node, RECT).await?))
    }

    async fn has_marker(&self, node: NodeId, marker: &str) -> Result<bool> {
        self.on(node, &format!("n.hasAttribute({})", json!(marker)))
            .await
    }

    async fn set_marker(&self, node: NodeId, marker: &str) -> Result<()> {
        self.on::<bool>(node, &format!("(n.setAttribute({}, ''), true)", json!(marker)))
            .await?;
        Ok(())
    }

    async fn hover(&self, node: NodeId) -> Result<()> {
        self.on::<bool>(node, HOVER).await?;
        Ok(())
    }

    async fn click(&self, node: NodeId) -> Result<()> {
        self.on::<bool>(node, "(n.click(), true)").await?;
        Ok(())
    }

    async fn scroll_metrics(&self, node: NodeId) -> Result<ScrollMetrics> {
        self.on(node, METRICS).await
    }

    async fn set_scroll_top(&self, node: NodeId, scroll_top: f64) -> Result<()> {
        let expr = format!(
            "(n.scrollTop = {}, n.dispatchEvent(new Event('scroll')), true)",
            json!(scroll_top)
        );
        self.on::<bool>(node, &expr).await?;
        Ok(())
    }

    async fn language(&self) -> Result<Option<String>> {
        self.eval("return document.documentElement.lang || null;")
            .await
    }

    fn subscribe(&self) -> broadcast::Receiver<MutationRecord> {
        self.feed.subscribe()
    }

    async fn is_descendant(&self, node: NodeId, ancestor: NodeId) -> Result<bool> {
        self.eval(&format!(
            "const n = r.get({}); const a = r.get({}); return !!n && !!a && n !== a && a.contains(n);",
            node.0, ancestor.0
        ))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Viewport;
    use std::path::PathBuf;

    #[test]
    fn launch_args_carry_profile_and_window() {
        let config = BrowserConfig {
            viewport: Viewport {
                width: 800,
                height: 600,
            },
            user_data_dir: Some(PathBuf::from("/tmp/dm-profile")),
            args: vec!["--lang=en".to_string()],
            ..Default::default()
        };
        let args = launch_args(&config);
        assert!(args.contains(&"--window-size=800,600".to_string()));
        assert!(args.contains(&"--user-data-dir=/tmp/dm-profile".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--lang=en"));
        assert!(!args.iter().any(|a| a.starts_with("--user-agent")));
    }
}
