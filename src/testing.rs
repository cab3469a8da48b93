//! Scripted conversation thread for driving the engine without a browser.
//!
//! [`ThreadSimulator`] builds a [`MemoryDocument`] shaped like a direct
//! message thread and installs a [`Behavior`] that reacts to hovers, clicks
//! and scrolling the way the hosted page does: hover affordances, floating
//! menus, confirmation dialogs, delayed removals and older pages streaming
//! in when the viewport reaches the top.

use crate::core::SharedDocument;
use crate::dom::{Behavior, Interaction, MemoryDocument, NodeSpec};
use crate::errors::{Result, SweepError};
use crate::types::{ElementRect, NodeId, ScrollMetrics};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

pub const ROW_HEIGHT: f64 = 40.0;
/// Distance from the top of the page to the top of the message pane.
pub const VIEW_TOP: f64 = 120.0;
pub const VIEW_HEIGHT: f64 = 480.0;
const ROW_WIDTH: f64 = 400.0;

const REVEAL_LABEL: &str = "See more options for message";
const SELF_AUTHOR: &str = "You";
const OTHER_AUTHOR: &str = "Alex";
const PASSIVE_ITEMS: [&str; 2] = ["Reply", "Forward"];
const ACTION_ITEMS: [&str; 2] = ["Unsend", "Delete"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    /// Own message offering both actions.
    Mine,
    /// Message from the other participant.
    Theirs,
    /// Own message whose menu lacks the actions.
    Unsupported,
    /// Own message that never shows its hover affordance.
    Inert,
}

impl RowKind {
    fn author(self) -> &'static str {
        match self {
            RowKind::Theirs => OTHER_AUTHOR,
            _ => SELF_AUTHOR,
        }
    }
}

#[derive(Debug, Clone)]
struct Settings {
    loader: bool,
    top_marker: bool,
    loader_delay: Duration,
    load_delay: Duration,
    removal_delay: Duration,
}

pub struct ThreadSimulatorBuilder {
    rows: Vec<RowKind>,
    older_pages: VecDeque<Vec<RowKind>>,
    settings: Settings,
}

impl Default for ThreadSimulatorBuilder {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            older_pages: VecDeque::new(),
            settings: Settings {
                loader: true,
                top_marker: true,
                loader_delay: Duration::from_millis(50),
                load_delay: Duration::from_millis(300),
                removal_delay: Duration::from_millis(100),
            },
        }
    }
}

impl ThreadSimulatorBuilder {
    /// Rows initially rendered, oldest first.
    pub fn rows(mut self, rows: &[RowKind]) -> Self {
        self.rows = rows.to_vec();
        self
    }

    /// Queues an older page; the first queued page is the next one loaded.
    pub fn older_page(mut self, rows: &[RowKind]) -> Self {
        self.older_pages.push_back(rows.to_vec());
        self
    }

    /// Whether a progress indicator is shown while a page loads.
    pub fn loader(mut self, enabled: bool) -> Self {
        self.settings.loader = enabled;
        self
    }

    /// Whether the profile header is rendered once every page is loaded.
    pub fn top_marker(mut self, enabled: bool) -> Self {
        self.settings.top_marker = enabled;
        self
    }

    pub fn loader_delay_ms(mut self, ms: u64) -> Self {
        self.settings.loader_delay = Duration::from_millis(ms);
        self
    }

    pub fn load_delay_ms(mut self, ms: u64) -> Self {
        self.settings.load_delay = Duration::from_millis(ms);
        self
    }

    pub fn removal_delay_ms(mut self, ms: u64) -> Self {
        self.settings.removal_delay = Duration::from_millis(ms);
        self
    }

    pub fn build(self) -> Result<ThreadSimulator> {
        let document = MemoryDocument::new();
        document.set_language(Some("en"));
        let root = document.root_id();

        let grid = document.append(root, NodeSpec::new("div").with_role("grid"))?;
        let mut parent = grid;
        for _ in 0..3 {
            parent = document.append(parent, NodeSpec::new("div"))?;
        }
        let container = document.append(
            parent,
            NodeSpec::new("div").with_scroll(ScrollMetrics {
                scroll_top: 0.0,
                scroll_height: VIEW_HEIGHT,
                client_height: VIEW_HEIGHT,
            }),
        )?;

        let thread = Arc::new(Thread {
            root,
            container,
            settings: self.settings,
            state: Mutex::new(SimState {
                pages: self.older_pages,
                ..Default::default()
            }),
        });
        {
            let mut state = thread.lock();
            let nodes = self
                .rows
                .iter()
                .map(|_| document.append(container, NodeSpec::new("div").with_role("row")))
                .collect::<Result<Vec<_>>>()?;
            thread.fill_rows(&document, &mut state, &nodes, &self.rows)?;
            state.rows = nodes
                .into_iter()
                .zip(self.rows.iter().copied())
                .map(|(node, kind)| SimRow { node, kind })
                .collect();
            if state.pages.is_empty() && thread.settings.top_marker {
                state.marker = Some(document.prepend(container, marker_spec())?);
            }
            thread.relayout(&document, &state)?;
        }
        document.set_behavior(Arc::new(ThreadBehavior {
            thread: thread.clone(),
        }));

        Ok(ThreadSimulator {
            document,
            thread,
        })
    }
}

/// A simulated conversation thread backed by a [`MemoryDocument`].
pub struct ThreadSimulator {
    document: MemoryDocument,
    thread: Arc<Thread>,
}

impl ThreadSimulator {
    pub fn builder() -> ThreadSimulatorBuilder {
        ThreadSimulatorBuilder::default()
    }

    pub fn document(&self) -> &MemoryDocument {
        &self.document
    }

    pub fn shared(&self) -> SharedDocument {
        Arc::new(self.document.clone())
    }

    /// The scrollable pane holding the rows.
    pub fn container(&self) -> NodeId {
        self.thread.container
    }

    /// Rows currently rendered, oldest first.
    pub fn rows(&self) -> Vec<NodeId> {
        self.thread.lock().rows.iter().map(|r| r.node).collect()
    }

    pub fn row_kind(&self, row: NodeId) -> Option<RowKind> {
        self.thread
            .lock()
            .rows
            .iter()
            .find(|r| r.node == row)
            .map(|r| r.kind)
    }

    /// Rows removed by a confirmed action, in removal order.
    pub fn removed(&self) -> Vec<NodeId> {
        self.thread.lock().removed.clone()
    }

    pub fn pages_remaining(&self) -> usize {
        self.thread.lock().pages.len()
    }

    pub fn top_marker(&self) -> Option<NodeId> {
        self.thread.lock().marker
    }
}

#[derive(Debug, Clone, Copy)]
struct SimRow {
    node: NodeId,
    kind: RowKind,
}

#[derive(Debug)]
struct OpenMenu {
    node: NodeId,
    row: NodeId,
    actions: HashMap<NodeId, &'static str>,
}

#[derive(Debug)]
struct OpenDialog {
    node: NodeId,
    confirm: NodeId,
    cancel: NodeId,
    row: NodeId,
}

#[derive(Debug, Default)]
struct SimState {
    rows: Vec<SimRow>,
    affordances: HashMap<NodeId, NodeId>,
    menu: Option<OpenMenu>,
    dialog: Option<OpenDialog>,
    pages: VecDeque<Vec<RowKind>>,
    loading: bool,
    marker: Option<NodeId>,
    loader: Option<NodeId>,
    next_message: usize,
    removed: Vec<NodeId>,
}

struct Thread {
    root: NodeId,
    container: NodeId,
    settings: Settings,
    state: Mutex<SimState>,
}

struct ThreadBehavior {
    thread: Arc<Thread>,
}

impl Behavior for ThreadBehavior {
    fn on_interaction(&self, document: &MemoryDocument, interaction: &Interaction) {
        if let Err(e) = self.thread.handle(document, interaction) {
            warn!(error = %e, ?interaction, "simulated thread failed to react");
        }
    }
}

fn marker_spec() -> NodeSpec {
    NodeSpec::new("a")
        .with_role("link")
        .with_aria_label("Profile picture of Alex")
}

impl Thread {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(self: &Arc<Self>, document: &MemoryDocument, interaction: &Interaction) -> Result<()> {
        match interaction {
            Interaction::Hover(node) => self.hovered(document, *node),
            Interaction::Click(node) => self.clicked(document, *node),
            Interaction::Scroll { node, scroll_top } if *node == self.container => {
                self.scrolled(document, *scroll_top)
            }
            Interaction::Scroll { .. } => Ok(()),
        }
    }

    fn hovered(&self, document: &MemoryDocument, node: NodeId) -> Result<()> {
        let mut state = self.lock();
        let Some(row) = state.rows.iter().find(|r| r.node == node).copied() else {
            return Ok(());
        };
        if row.kind == RowKind::Inert || state.affordances.values().any(|r| *r == node) {
            return Ok(());
        }
        let label = format!("{} from {}", REVEAL_LABEL, row.kind.author());
        let control = document.append(
            node,
            NodeSpec::new("div")
                .with_role("button")
                .with_aria_label(&label),
        )?;
        state.affordances.insert(control, node);
        Ok(())
    }

    fn clicked(self: &Arc<Self>, document: &MemoryDocument, node: NodeId) -> Result<()> {
        let mut state = self.lock();
        if let Some(row) = state.affordances.get(&node).copied() {
            return self.open_menu(document, &mut state, row);
        }
        if let Some(label) = state
            .menu
            .as_ref()
            .and_then(|menu| menu.actions.get(&node).copied())
        {
            return self.open_dialog(document, &mut state, label);
        }
        let Some(dialog) = state.dialog.as_ref() else {
            return Ok(());
        };
        let confirmed = dialog.confirm == node;
        if !confirmed && dialog.cancel != node {
            return Ok(());
        }
        let (dialog_node, row) = (dialog.node, dialog.row);
        state.dialog = None;
        document.remove(dialog_node)?;
        if confirmed {
            self.schedule_removal(document, &mut state, row)?;
        }
        Ok(())
    }

    fn open_menu(&self, document: &MemoryDocument, state: &mut SimState, row: NodeId) -> Result<()> {
        if let Some(menu) = state.menu.take() {
            ignore_stale(document.remove(menu.node))?;
        }
        let Some(kind) = state.rows.iter().find(|r| r.node == row).map(|r| r.kind) else {
            return Ok(());
        };
        let menu = document.append(self.root, NodeSpec::new("div").with_role("menu"))?;
        let mut actions = HashMap::new();
        let offers_actions = kind == RowKind::Mine;
        let labels = PASSIVE_ITEMS
            .iter()
            .chain(ACTION_ITEMS.iter().filter(|_| offers_actions));
        for label in labels {
            let wrapper = document.append(menu, NodeSpec::new("div").with_role("menuitem"))?;
            let item = document.append(wrapper, NodeSpec::new("span").with_text(label))?;
            if ACTION_ITEMS.contains(label) {
                actions.insert(item, *label);
            }
        }
        debug!(%row, ?kind, "menu opened");
        state.menu = Some(OpenMenu {
            node: menu,
            row,
            actions,
        });
        Ok(())
    }

    fn open_dialog(&self, document: &MemoryDocument, state: &mut SimState, label: &str) -> Result<()> {
        let Some(menu) = state.menu.take() else {
            return Ok(());
        };
        ignore_stale(document.remove(menu.node))?;
        let dialog = document.append(self.root, NodeSpec::new("div").with_role("dialog"))?;
        let body = document.append(dialog, NodeSpec::new("div"))?;
        let confirm = document.append(body, NodeSpec::new("button").with_text(label))?;
        let cancel = document.append(body, NodeSpec::new("button").with_text("Cancel"))?;
        state.dialog = Some(OpenDialog {
            node: dialog,
            confirm,
            cancel,
            row: menu.row,
        });
        Ok(())
    }

    fn schedule_removal(
        self: &Arc<Self>,
        document: &MemoryDocument,
        state: &mut SimState,
        row: NodeId,
    ) -> Result<()> {
        if self.settings.removal_delay.is_zero() {
            return self.remove_row(document, state, row);
        }
        let thread = Arc::clone(self);
        let document = document.clone();
        let delay = self.settings.removal_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = thread.lock();
            if let Err(e) = thread.remove_row(&document, &mut state, row) {
                warn!(error = %e, %row, "simulated removal failed");
            }
        });
        Ok(())
    }

    fn remove_row(&self, document: &MemoryDocument, state: &mut SimState, row: NodeId) -> Result<()> {
        if !state.rows.iter().any(|r| r.node == row) {
            return Ok(());
        }
        ignore_stale(document.remove(row))?;
        state.rows.retain(|r| r.node != row);
        state.affordances.retain(|_, r| *r != row);
        state.removed.push(row);
        self.relayout(document, state)
    }

    fn scrolled(self: &Arc<Self>, document: &MemoryDocument, scroll_top: f64) -> Result<()> {
        let mut state = self.lock();
        self.relayout(document, &state)?;
        if scroll_top > 0.0 || state.loading || state.pages.is_empty() {
            return Ok(());
        }
        state.loading = true;
        let thread = Arc::clone(self);
        let document = document.clone();
        tokio::spawn(async move {
            if let Err(e) = thread.load_page(&document).await {
                warn!(error = %e, "simulated page load failed");
            }
            thread.lock().loading = false;
        });
        Ok(())
    }

    async fn load_page(&self, document: &MemoryDocument) -> Result<()> {
        if self.settings.loader {
            tokio::time::sleep(self.settings.loader_delay).await;
            let loader = document.prepend(
                self.container,
                NodeSpec::new("div").with_role("progressbar"),
            )?;
            self.lock().loader = Some(loader);
        }
        tokio::time::sleep(self.settings.load_delay).await;

        let added = {
            let mut state = self.lock();
            let added = self.deliver_page(document, &mut state)?;
            if self.settings.loader {
                self.anchor(document, &state, added)?;
            }
            added
        };
        if !self.settings.loader {
            // Without a loader the position is restored a beat after the
            // content lands.
            tokio::time::sleep(Duration::from_millis(1)).await;
            let state = self.lock();
            self.anchor(document, &state, added)?;
        }
        Ok(())
    }

    /// Inserts the next older page above the current rows. Returns the
    /// height added above the viewport.
    fn deliver_page(&self, document: &MemoryDocument, state: &mut SimState) -> Result<f64> {
        if let Some(loader) = state.loader.take() {
            ignore_stale(document.remove(loader))?;
        }
        let Some(page) = state.pages.pop_front() else {
            return Ok(0.0);
        };
        let specs = page
            .iter()
            .map(|_| NodeSpec::new("div").with_role("row"))
            .collect();
        let nodes = document.prepend_all(self.container, specs)?;
        self.fill_rows(document, state, &nodes, &page)?;
        let older = nodes
            .iter()
            .copied()
            .zip(page.iter().copied())
            .map(|(node, kind)| SimRow { node, kind });
        state.rows.splice(0..0, older);

        let mut slots = page.len();
        if state.pages.is_empty() && self.settings.top_marker {
            state.marker = Some(document.prepend(self.container, marker_spec())?);
            slots += 1;
        }
        debug!(rows = page.len(), remaining = state.pages.len(), "older page delivered");
        self.relayout(document, state)?;
        Ok(slots as f64 * ROW_HEIGHT)
    }

    fn fill_rows(
        &self,
        document: &MemoryDocument,
        state: &mut SimState,
        nodes: &[NodeId],
        kinds: &[RowKind],
    ) -> Result<()> {
        for (node, kind) in nodes.iter().zip(kinds) {
            state.next_message += 1;
            document.append(*node, NodeSpec::new("span").with_text(kind.author()))?;
            let body = format!("message {}", state.next_message);
            document.append(*node, NodeSpec::new("span").with_text(&body))?;
        }
        Ok(())
    }

    /// Keeps the rows on screen in place after content was added above them.
    fn anchor(&self, document: &MemoryDocument, state: &SimState, added: f64) -> Result<()> {
        let mut metrics = document.scroll_state(self.container).unwrap_or_default();
        metrics.scroll_top += added;
        document.set_scroll_metrics(self.container, metrics)?;
        self.relayout(document, state)
    }

    /// Recomputes scroll extent and row geometry. Rows wholly outside the
    /// pane are reported hidden.
    fn relayout(&self, document: &MemoryDocument, state: &SimState) -> Result<()> {
        let slots: Vec<NodeId> = state
            .marker
            .into_iter()
            .chain(state.rows.iter().map(|r| r.node))
            .collect();

        let mut metrics = document.scroll_state(self.container).unwrap_or_default();
        metrics.client_height = VIEW_HEIGHT;
        metrics.scroll_height = (slots.len() as f64 * ROW_HEIGHT).max(VIEW_HEIGHT);
        metrics.scroll_top = metrics.scroll_top.clamp(0.0, metrics.max_scroll_top());
        document.set_scroll_metrics(self.container, metrics)?;

        for (index, node) in slots.iter().enumerate() {
            let y = VIEW_TOP + index as f64 * ROW_HEIGHT - metrics.scroll_top;
            let outside = y + ROW_HEIGHT <= VIEW_TOP || y >= VIEW_TOP + VIEW_HEIGHT;
            document.set_rect(*node, ElementRect::new(0.0, y, ROW_WIDTH, ROW_HEIGHT))?;
            document.set_hidden(*node, outside)?;
        }
        Ok(())
    }
}

fn ignore_stale(result: Result<()>) -> Result<()> {
    match result {
        Err(SweepError::StaleNode(_)) => Ok(()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Document;
    use crate::dom::Locator;
    use crate::layout::Layout;

    #[tokio::test(start_paused = true)]
    async fn hover_menu_dialog_and_removal() {
        let sim = ThreadSimulator::builder()
            .rows(&[RowKind::Theirs, RowKind::Mine])
            .removal_delay_ms(0)
            .build()
            .unwrap();
        let doc = sim.document();
        let layout = Layout::english();
        let row = sim.rows()[1];

        doc.hover(row).await.unwrap();
        let control = doc
            .query(Some(row), &layout.reveal_control)
            .await
            .unwrap()
            .unwrap();
        doc.click(control).await.unwrap();
        let item = doc
            .query(None, &layout.menu_item(crate::types::RunMode::Unsend))
            .await
            .unwrap()
            .unwrap();
        doc.click(item).await.unwrap();
        let confirm = doc
            .query(None, &layout.confirm_control)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.text(confirm).await.unwrap(), "Unsend");
        doc.click(confirm).await.unwrap();

        assert_eq!(sim.removed(), vec![row]);
        assert_eq!(sim.rows().len(), 1);
        assert!(doc.query(None, &Locator::role("dialog")).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn only_own_rows_match_the_layout() {
        let sim = ThreadSimulator::builder()
            .rows(&[RowKind::Mine, RowKind::Theirs, RowKind::Inert])
            .build()
            .unwrap();
        let layout = Layout::english();
        let eligible = sim
            .document()
            .query_all(Some(sim.container()), &layout.eligible_row())
            .await
            .unwrap();
        let rows = sim.rows();
        assert_eq!(eligible, vec![rows[0], rows[2]]);
        let root = sim
            .document()
            .query(None, &layout.messages_root)
            .await
            .unwrap();
        assert_eq!(root, Some(sim.container()));
    }

    #[tokio::test(start_paused = true)]
    async fn reaching_the_top_streams_in_an_older_page() {
        let sim = ThreadSimulator::builder()
            .rows(&[RowKind::Theirs; 15])
            .older_page(&[RowKind::Mine, RowKind::Mine])
            .build()
            .unwrap();
        let doc = sim.document();
        let container = sim.container();
        assert!(sim.top_marker().is_none());
        assert_eq!(doc.scroll_metrics(container).await.unwrap().max_scroll_top(), 120.0);

        doc.set_scroll_top(container, 0.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(doc
            .query(Some(container), &Locator::role("progressbar"))
            .await
            .unwrap()
            .is_some());

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(doc
            .query(Some(container), &Locator::role("progressbar"))
            .await
            .unwrap()
            .is_none());
        assert_eq!(sim.rows().len(), 17);
        assert_eq!(sim.pages_remaining(), 0);
        assert!(sim.top_marker().is_some());
        // Two rows and the header landed above the viewport.
        assert_eq!(doc.scroll_metrics(container).await.unwrap().scroll_top, 120.0);
    }

    #[tokio::test(start_paused = true)]
    async fn rows_outside_the_pane_are_hidden() {
        let sim = ThreadSimulator::builder()
            .rows(&[RowKind::Mine; 20])
            .top_marker(false)
            .build()
            .unwrap();
        let doc = sim.document();
        let rows = sim.rows();
        assert!(doc.is_visible(rows[0]).await.unwrap());
        assert!(!doc.is_visible(rows[19]).await.unwrap());

        doc.set_scroll_top(sim.container(), 10_000.0).await.unwrap();
        assert!(!doc.is_visible(rows[0]).await.unwrap());
        assert!(doc.is_visible(rows[19]).await.unwrap());
    }
}
