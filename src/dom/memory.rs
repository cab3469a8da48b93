use crate::core::{Document, MutationRecord};
use crate::dom::Locator;
use crate::errors::{Result, SweepError};
use crate::types::{ElementRect, NodeId, ScrollMetrics};
use async_trait::async_trait;
use scraper::{ElementRef, Html, Node};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

const FEED_CAPACITY: usize = 256;

/// Description of a node to insert into a [`MemoryDocument`].
#[derive(Debug, Clone, Default)]
pub struct NodeSpec {
    pub tag: String,
    pub role: Option<String>,
    pub aria_label: Option<String>,
    pub text: Option<String>,
    pub attributes: BTreeSet<String>,
    pub hidden: bool,
    pub rect: Option<ElementRect>,
    pub scroll: Option<ScrollMetrics>,
}

impl NodeSpec {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            ..Default::default()
        }
    }

    pub fn with_role(mut self, role: &str) -> Self {
        self.role = Some(role.to_string());
        self
    }

    pub fn with_aria_label(mut self, label: &str) -> Self {
        self.aria_label = Some(label.to_string());
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub fn with_attribute(mut self, name: &str) -> Self {
        self.attributes.insert(name.to_string());
        self
    }

    pub fn with_rect(mut self, rect: ElementRect) -> Self {
        self.rect = Some(rect);
        self
    }

    pub fn with_scroll(mut self, scroll: ScrollMetrics) -> Self {
        self.scroll = Some(scroll);
        self
    }

    pub fn hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }
}

/// An interaction performed on the document, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum Interaction {
    Hover(NodeId),
    Click(NodeId),
    Scroll { node: NodeId, scroll_top: f64 },
}

impl Interaction {
    pub fn node(&self) -> NodeId {
        match self {
            Interaction::Hover(node) | Interaction::Click(node) => *node,
            Interaction::Scroll { node, .. } => *node,
        }
    }
}

/// How the simulated renderer reacts to interactions.
///
/// Called after the interaction has been applied and with no lock held, so
/// implementations may mutate the document or spawn tasks that do so later.
pub trait Behavior: Send + Sync {
    fn on_interaction(&self, document: &MemoryDocument, interaction: &Interaction);
}

#[derive(Debug)]
struct MemNode {
    spec: NodeSpec,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Debug)]
struct Tree {
    nodes: HashMap<NodeId, MemNode>,
    root: NodeId,
    next_id: u64,
    language: Option<String>,
    interactions: Vec<Interaction>,
}

struct Inner {
    tree: Mutex<Tree>,
    events: broadcast::Sender<MutationRecord>,
    behavior: Mutex<Option<Arc<dyn Behavior>>>,
}

/// In-memory external tree with change notifications.
///
/// Cloning is cheap and every clone observes the same tree.
#[derive(Clone)]
pub struct MemoryDocument {
    inner: Arc<Inner>,
}

impl Default for MemoryDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocument {
    pub fn new() -> Self {
        let root = NodeId(1);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            MemNode {
                spec: NodeSpec::new("body"),
                parent: None,
                children: Vec::new(),
            },
        );
        let (events, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                tree: Mutex::new(Tree {
                    nodes,
                    root,
                    next_id: 2,
                    language: None,
                    interactions: Vec::new(),
                }),
                events,
                behavior: Mutex::new(None),
            }),
        }
    }

    /// Builds a document from the `<body>` of an HTML snapshot.
    ///
    /// Geometry is not part of HTML, so nodes get no bounding rect; an
    /// element carrying the `hidden` attribute is treated as hidden.
    pub fn from_html(html: &str) -> Result<Self> {
        let parsed = Html::parse_document(html);
        let body_selector = scraper::Selector::parse("body")
            .map_err(|e| SweepError::Discovery(format!("invalid selector: {:?}", e)))?;
        let body = parsed
            .select(&body_selector)
            .next()
            .ok_or_else(|| SweepError::Discovery("HTML snapshot has no <body>".to_string()))?;

        let document = Self::new();
        {
            let mut tree = document.tree();
            tree.language = parsed
                .root_element()
                .value()
                .attr("lang")
                .map(|lang| lang.to_string());
            let root = tree.root;
            Self::import_children(&mut tree, root, body);
        }
        Ok(document)
    }

    fn import_children(tree: &mut Tree, parent: NodeId, element: ElementRef<'_>) {
        let mut own_text = String::new();
        for child in element.children() {
            match child.value() {
                Node::Text(text) => own_text.push_str(text.trim()),
                Node::Element(_) => {
                    if let Some(child_ref) = ElementRef::wrap(child) {
                        let value = child_ref.value();
                        let mut spec = NodeSpec::new(value.name());
                        spec.role = value.attr("role").map(|s| s.to_string());
                        spec.aria_label = value.attr("aria-label").map(|s| s.to_string());
                        spec.hidden = value.attr("hidden").is_some();
                        for (name, _) in value.attrs() {
                            if name.starts_with("data-") {
                                spec.attributes.insert(name.to_string());
                            }
                        }
                        let id = tree.insert(parent, None, spec);
                        Self::import_children(tree, id, child_ref);
                    }
                }
                _ => {}
            }
        }
        if !own_text.is_empty() {
            if let Some(node) = tree.nodes.get_mut(&parent) {
                node.spec.text = Some(own_text);
            }
        }
    }

    fn tree(&self) -> MutexGuard<'_, Tree> {
        self.inner
            .tree
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_behavior(&self, behavior: Arc<dyn Behavior>) {
        *self
            .inner
            .behavior
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(behavior);
    }

    pub fn set_language(&self, language: Option<&str>) {
        self.tree().language = language.map(|l| l.to_string());
    }

    pub fn root_id(&self) -> NodeId {
        self.tree().root
    }

    pub fn append(&self, parent: NodeId, spec: NodeSpec) -> Result<NodeId> {
        self.insert_child(parent, None, spec)
    }

    pub fn prepend(&self, parent: NodeId, spec: NodeSpec) -> Result<NodeId> {
        self.insert_child(parent, Some(0), spec)
    }

    /// Inserts several siblings at the front of `parent` in a single change.
    pub fn prepend_all(&self, parent: NodeId, specs: Vec<NodeSpec>) -> Result<Vec<NodeId>> {
        let added = {
            let mut tree = self.tree();
            if !tree.nodes.contains_key(&parent) {
                return Err(SweepError::StaleNode(parent));
            }
            specs
                .into_iter()
                .enumerate()
                .map(|(index, spec)| tree.insert(parent, Some(index), spec))
                .collect::<Vec<_>>()
        };
        self.notify(MutationRecord {
            target: Some(parent),
            added: added.clone(),
            removed: Vec::new(),
        });
        Ok(added)
    }

    fn insert_child(&self, parent: NodeId, index: Option<usize>, spec: NodeSpec) -> Result<NodeId> {
        let id = {
            let mut tree = self.tree();
            if !tree.nodes.contains_key(&parent) {
                return Err(SweepError::StaleNode(parent));
            }
            tree.insert(parent, index, spec)
        };
        self.notify(MutationRecord {
            target: Some(parent),
            added: vec![id],
            removed: Vec::new(),
        });
        Ok(id)
    }

    /// Detaches the node and its whole subtree.
    pub fn remove(&self, node: NodeId) -> Result<()> {
        let parent = {
            let mut tree = self.tree();
            let parent = tree
                .nodes
                .get(&node)
                .ok_or(SweepError::StaleNode(node))?
                .parent;
            if let Some(parent_node) = parent.and_then(|p| tree.nodes.get_mut(&p)) {
                parent_node.children.retain(|c| *c != node);
            }
            tree.drop_subtree(node);
            parent
        };
        self.notify(MutationRecord {
            target: parent,
            added: Vec::new(),
            removed: vec![node],
        });
        Ok(())
    }

    pub fn set_rect(&self, node: NodeId, rect: ElementRect) -> Result<()> {
        self.with_node(node, |n| n.spec.rect = Some(rect))
    }

    pub fn set_hidden(&self, node: NodeId, hidden: bool) -> Result<()> {
        self.with_node(node, |n| n.spec.hidden = hidden)
    }

    /// Replaces the scroll state without recording an interaction, the way
    /// the renderer itself moves content around.
    pub fn set_scroll_metrics(&self, node: NodeId, metrics: ScrollMetrics) -> Result<()> {
        self.with_node(node, |n| n.spec.scroll = Some(metrics))
    }

    pub fn scroll_state(&self, node: NodeId) -> Option<ScrollMetrics> {
        self.tree().nodes.get(&node).and_then(|n| n.spec.scroll)
    }

    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.tree()
            .nodes
            .get(&node)
            .map(|n| n.children.clone())
            .unwrap_or_default()
    }

    pub fn is_attached(&self, node: NodeId) -> bool {
        self.tree().nodes.contains_key(&node)
    }

    pub fn attribute_set(&self, node: NodeId) -> BTreeSet<String> {
        self.tree()
            .nodes
            .get(&node)
            .map(|n| n.spec.attributes.clone())
            .unwrap_or_default()
    }

    pub fn interactions(&self) -> Vec<Interaction> {
        self.tree().interactions.clone()
    }

    /// Number of live change-notification receivers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.events.receiver_count()
    }

    /// Emits a change notification without changing the tree.
    pub fn touch(&self, target: Option<NodeId>) {
        self.notify(MutationRecord {
            target,
            added: Vec::new(),
            removed: Vec::new(),
        });
    }

    fn with_node(&self, node: NodeId, apply: impl FnOnce(&mut MemNode)) -> Result<()> {
        let mut tree = self.tree();
        let entry = tree.nodes.get_mut(&node).ok_or(SweepError::StaleNode(node))?;
        apply(entry);
        Ok(())
    }

    fn notify(&self, record: MutationRecord) {
        // Nobody listening is fine.
        let _ = self.inner.events.send(record);
    }

    fn interact(&self, interaction: Interaction) -> Result<()> {
        {
            let mut tree = self.tree();
            if !tree.nodes.contains_key(&interaction.node()) {
                return Err(SweepError::StaleNode(interaction.node()));
            }
            tree.interactions.push(interaction.clone());
        }
        let behavior = self
            .inner
            .behavior
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(behavior) = behavior {
            behavior.on_interaction(self, &interaction);
        }
        Ok(())
    }
}

impl Tree {
    fn insert(&mut self, parent: NodeId, index: Option<usize>, spec: NodeSpec) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(
            id,
            MemNode {
                spec,
                parent: Some(parent),
                children: Vec::new(),
            },
        );
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            match index {
                Some(i) if i < parent_node.children.len() => parent_node.children.insert(i, id),
                _ => parent_node.children.push(id),
            }
        }
        id
    }

    fn drop_subtree(&mut self, node: NodeId) {
        if let Some(removed) = self.nodes.remove(&node) {
            for child in removed.children {
                self.drop_subtree(child);
            }
        }
    }

    fn node(&self, id: NodeId) -> Result<&MemNode> {
        self.nodes.get(&id).ok_or(SweepError::StaleNode(id))
    }

    fn descendants(&self, scope: NodeId, out: &mut Vec<NodeId>) {
        if let Some(node) = self.nodes.get(&scope) {
            for child in &node.children {
                out.push(*child);
                self.descendants(*child, out);
            }
        }
    }

    fn text_content(&self, id: NodeId) -> String {
        let mut text = String::new();
        self.collect_text(id, &mut text);
        text
    }

    fn collect_text(&self, id: NodeId, out: &mut String) {
        if let Some(node) = self.nodes.get(&id) {
            if let Some(own) = &node.spec.text {
                out.push_str(own);
            }
            for child in &node.children {
                self.collect_text(*child, out);
            }
        }
    }

    fn matches(&self, id: NodeId, locator: &Locator, scope: NodeId) -> bool {
        let Some(node) = self.nodes.get(&id) else {
            return false;
        };
        let spec = &node.spec;
        match locator {
            Locator::Tag(name) => spec.tag == *name,
            Locator::Role(role) => spec.role.as_deref() == Some(role.as_str()),
            Locator::AriaLabelPrefix(prefix) => spec
                .aria_label
                .as_deref()
                .map(|label| label.starts_with(prefix.as_str()))
                .unwrap_or(false),
            Locator::Text(wanted) => spec
                .text
                .as_deref()
                .filter(|own| !own.is_empty())
                .map(|_| {
                    self.text_content(id).trim().to_lowercase() == wanted.trim().to_lowercase()
                })
                .unwrap_or(false),
            Locator::TextPrefix(prefix) => {
                let text = self.text_content(id);
                text.chars().count() > prefix.chars().count() && text.starts_with(prefix.as_str())
            }
            Locator::Marker(name) => spec.attributes.contains(name),
            Locator::Not(inner) => !self.matches(id, inner, scope),
            Locator::All(parts) => parts.iter().all(|p| self.matches(id, p, scope)),
            Locator::Any(parts) => parts.iter().any(|p| self.matches(id, p, scope)),
            Locator::Within(ancestor, inner) => {
                if !self.matches(id, inner, scope) {
                    return false;
                }
                let mut current = node.parent;
                while let Some(candidate) = current {
                    if candidate == scope {
                        break;
                    }
                    if self.matches(candidate, ancestor, scope) {
                        return true;
                    }
                    current = self.nodes.get(&candidate).and_then(|n| n.parent);
                }
                false
            }
            Locator::Child(parent, inner) => {
                self.matches(id, inner, scope)
                    && node
                        .parent
                        .filter(|p| *p != scope)
                        .map(|p| self.matches(p, parent, scope))
                        .unwrap_or(false)
            }
        }
    }

    fn is_visible(&self, id: NodeId) -> Result<bool> {
        let mut current = Some(id);
        while let Some(candidate) = current {
            let node = self.node(candidate)?;
            if node.spec.hidden {
                return Ok(false);
            }
            current = node.parent;
        }
        Ok(true)
    }
}

#[async_trait]
impl Document for MemoryDocument {
    async fn root(&self) -> Result<NodeId> {
        Ok(self.root_id())
    }

    async fn query_all(&self, scope: Option<NodeId>, locator: &Locator) -> Result<Vec<NodeId>> {
        let tree = self.tree();
        let scope = scope.unwrap_or(tree.root);
        tree.node(scope)?;
        let mut candidates = Vec::new();
        tree.descendants(scope, &mut candidates);
        Ok(candidates
            .into_iter()
            .filter(|id| tree.matches(*id, locator, scope))
            .collect())
    }

    async fn contains(&self, node: NodeId) -> Result<bool> {
        Ok(self.is_attached(node))
    }

    async fn text(&self, node: NodeId) -> Result<String> {
        let tree = self.tree();
        tree.node(node)?;
        Ok(tree.text_content(node))
    }

    async fn is_visible(&self, node: NodeId) -> Result<bool> {
        self.tree().is_visible(node)
    }

    async fn bounding_rect(&self, node: NodeId) -> Result<Option<ElementRect>> {
        Ok(self.tree().node(node)?.spec.rect)
    }

    async fn has_marker(&self, node: NodeId, marker: &str) -> Result<bool> {
        Ok(self.tree().node(node)?.spec.attributes.contains(marker))
    }

    async fn set_marker(&self, node: NodeId, marker: &str) -> Result<()> {
        self.with_node(node, |n| {
            n.spec.attributes.insert(marker.to_string());
        })
    }

    async fn hover(&self, node: NodeId) -> Result<()> {
        self.interact(Interaction::Hover(node))
    }

    async fn click(&self, node: NodeId) -> Result<()> {
        self.interact(Interaction::Click(node))
    }

    async fn scroll_metrics(&self, node: NodeId) -> Result<ScrollMetrics> {
        Ok(self.tree().node(node)?.spec.scroll.unwrap_or_default())
    }

    async fn set_scroll_top(&self, node: NodeId, scroll_top: f64) -> Result<()> {
        let clamped = {
            let mut tree = self.tree();
            let entry = tree.nodes.get_mut(&node).ok_or(SweepError::StaleNode(node))?;
            let mut metrics = entry.spec.scroll.unwrap_or_default();
            metrics.scroll_top = scroll_top.clamp(0.0, metrics.max_scroll_top());
            entry.spec.scroll = Some(metrics);
            metrics.scroll_top
        };
        self.interact(Interaction::Scroll {
            node,
            scroll_top: clamped,
        })
    }

    async fn language(&self) -> Result<Option<String>> {
        Ok(self.tree().language.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<MutationRecord> {
        self.inner.events.subscribe()
    }

    async fn is_descendant(&self, node: NodeId, ancestor: NodeId) -> Result<bool> {
        let tree = self.tree();
        let mut current = tree.nodes.get(&node).and_then(|n| n.parent);
        while let Some(candidate) = current {
            if candidate == ancestor {
                return Ok(true);
            }
            current = tree.nodes.get(&candidate).and_then(|n| n.parent);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation() -> (MemoryDocument, NodeId, Vec<NodeId>) {
        let doc = MemoryDocument::new();
        let root = doc.root_id();
        let list = doc.append(root, NodeSpec::new("div").with_role("grid")).unwrap();
        let rows = ["You sent hi", "Alex: hey", "You sent bye"]
            .iter()
            .map(|text| {
                let row = doc.append(list, NodeSpec::new("div").with_role("row")).unwrap();
                doc.append(row, NodeSpec::new("span").with_text(text)).unwrap();
                row
            })
            .collect();
        (doc, list, rows)
    }

    #[tokio::test]
    async fn queries_follow_document_order_and_scope() {
        let (doc, list, rows) = conversation();
        let mine = Locator::role("row").and(Locator::text_prefix("You"));
        assert_eq!(
            doc.query_all(None, &mine).await.unwrap(),
            vec![rows[0], rows[2]]
        );
        assert_eq!(doc.query_all(Some(rows[1]), &mine).await.unwrap(), vec![]);
        assert_eq!(
            doc.query(Some(list), &Locator::role("row")).await.unwrap(),
            Some(rows[0])
        );
    }

    #[tokio::test]
    async fn markers_exclude_nodes_from_queries() {
        let (doc, _, rows) = conversation();
        doc.set_marker(rows[2], "data-skip").await.unwrap();
        let eligible = Locator::role("row")
            .and(Locator::text_prefix("You"))
            .and(Locator::marker("data-skip").not());
        assert_eq!(doc.query_all(None, &eligible).await.unwrap(), vec![rows[0]]);
    }

    #[tokio::test]
    async fn removal_detaches_subtree_and_notifies() {
        let (doc, list, rows) = conversation();
        let mut feed = doc.subscribe();
        let span = doc.children(rows[0])[0];
        doc.remove(rows[0]).unwrap();

        assert!(!doc.contains(rows[0]).await.unwrap());
        assert!(!doc.contains(span).await.unwrap());
        assert!(matches!(
            doc.text(span).await,
            Err(SweepError::StaleNode(id)) if id == span
        ));
        let record = feed.recv().await.unwrap();
        assert_eq!(record.target, Some(list));
        assert_eq!(record.removed, vec![rows[0]]);
    }

    #[tokio::test]
    async fn own_text_locator_ignores_descendant_only_text() {
        let doc = MemoryDocument::new();
        let root = doc.root_id();
        let menu = doc.append(root, NodeSpec::new("div")).unwrap();
        let item = doc.append(menu, NodeSpec::new("span").with_text(" Unsend ")).unwrap();
        assert_eq!(
            doc.query_all(None, &Locator::text("unsend")).await.unwrap(),
            vec![item]
        );
    }

    #[tokio::test]
    async fn within_and_child_relations() {
        let doc = MemoryDocument::new();
        let root = doc.root_id();
        let dialog = doc.append(root, NodeSpec::new("div").with_role("dialog")).unwrap();
        let wrapper = doc.append(dialog, NodeSpec::new("div")).unwrap();
        let button = doc.append(wrapper, NodeSpec::new("button").with_text("Unsend")).unwrap();
        let stray = doc.append(root, NodeSpec::new("button")).unwrap();

        let in_dialog = Locator::tag("button").within(Locator::role("dialog"));
        assert_eq!(doc.query_all(None, &in_dialog).await.unwrap(), vec![button]);

        let direct = Locator::tag("div").child_of(Locator::role("dialog"));
        assert_eq!(doc.query_all(None, &direct).await.unwrap(), vec![wrapper]);
        assert!(!doc.query_all(None, &in_dialog).await.unwrap().contains(&stray));
    }

    #[tokio::test]
    async fn hidden_ancestors_hide_descendants() {
        let (doc, list, rows) = conversation();
        assert!(doc.is_visible(rows[1]).await.unwrap());
        doc.set_hidden(list, true).unwrap();
        assert!(!doc.is_visible(rows[1]).await.unwrap());
    }

    #[tokio::test]
    async fn scrolling_clamps_and_is_recorded() {
        let doc = MemoryDocument::new();
        let root = doc.root_id();
        let pane = doc
            .append(
                root,
                NodeSpec::new("div").with_scroll(ScrollMetrics {
                    scroll_top: 0.0,
                    scroll_height: 1000.0,
                    client_height: 400.0,
                }),
            )
            .unwrap();
        doc.set_scroll_top(pane, 5000.0).await.unwrap();
        assert_eq!(doc.scroll_metrics(pane).await.unwrap().scroll_top, 600.0);
        doc.set_scroll_top(pane, -3.0).await.unwrap();
        assert_eq!(
            doc.interactions(),
            vec![
                Interaction::Scroll {
                    node: pane,
                    scroll_top: 600.0
                },
                Interaction::Scroll {
                    node: pane,
                    scroll_top: 0.0
                },
            ]
        );
    }

    #[tokio::test]
    async fn imports_html_snapshots() {
        let doc = MemoryDocument::from_html(
            r#"<html lang="fr"><body>
                <div role="grid"><div><div role="row" data-seen="1"><span>You sent a photo</span></div></div></div>
                <div hidden><button aria-label="See more options for message">x</button></div>
            </body></html>"#,
        )
        .unwrap();

        assert_eq!(doc.language().await.unwrap().as_deref(), Some("fr"));
        let rows = doc.query_all(None, &Locator::role("row")).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(doc.text(rows[0]).await.unwrap(), "You sent a photo");
        assert!(doc.has_marker(rows[0], "data-seen").await.unwrap());

        let button = doc
            .query(None, &Locator::aria_label_prefix("See more options"))
            .await
            .unwrap()
            .unwrap();
        assert!(!doc.is_visible(button).await.unwrap());
    }
}
