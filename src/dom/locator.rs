use serde::{Deserialize, Serialize};

/// Declarative description of the nodes a query should match.
///
/// Locators are plain data so a [`Layout`](crate::layout::Layout) can be
/// written down, serialised, and swapped without touching engine code. Each
/// backend evaluates them its own way: the in-memory document walks its
/// tree, the browser backend compiles them into a JavaScript predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Locator {
    /// Lower-case element name, e.g. `div`.
    Tag(String),
    /// Value of the `role` attribute.
    Role(String),
    /// `aria-label` starting with the given text.
    AriaLabelPrefix(String),
    /// Node whose own leading text, trimmed, equals the value ignoring case.
    Text(String),
    /// Full text content starting with the value and longer than it.
    TextPrefix(String),
    /// Node carries the named attribute.
    Marker(String),
    Not(Box<Locator>),
    All(Vec<Locator>),
    Any(Vec<Locator>),
    /// `(ancestor, node)`: node matching the second locator with an ancestor
    /// matching the first, below the query scope.
    Within(Box<Locator>, Box<Locator>),
    /// `(parent, node)`: node matching the second locator whose direct parent
    /// matches the first.
    Child(Box<Locator>, Box<Locator>),
}

impl Locator {
    pub fn tag(name: &str) -> Self {
        Locator::Tag(name.to_ascii_lowercase())
    }

    pub fn role(role: &str) -> Self {
        Locator::Role(role.to_string())
    }

    pub fn aria_label_prefix(prefix: &str) -> Self {
        Locator::AriaLabelPrefix(prefix.to_string())
    }

    pub fn text(text: &str) -> Self {
        Locator::Text(text.to_string())
    }

    pub fn text_prefix(prefix: &str) -> Self {
        Locator::TextPrefix(prefix.to_string())
    }

    pub fn marker(name: &str) -> Self {
        Locator::Marker(name.to_string())
    }

    pub fn not(self) -> Self {
        Locator::Not(Box::new(self))
    }

    pub fn and(self, other: Locator) -> Self {
        match self {
            Locator::All(mut parts) => {
                parts.push(other);
                Locator::All(parts)
            }
            first => Locator::All(vec![first, other]),
        }
    }

    pub fn within(self, ancestor: Locator) -> Self {
        Locator::Within(Box::new(ancestor), Box::new(self))
    }

    pub fn child_of(self, parent: Locator) -> Self {
        Locator::Child(Box::new(parent), Box::new(self))
    }

    /// `first > second > ...` as a chain of direct-child steps.
    pub fn child_chain(steps: Vec<Locator>) -> Option<Self> {
        let mut steps = steps.into_iter();
        let first = steps.next()?;
        Some(steps.fold(first, |parent, step| step.child_of(parent)))
    }

    /// JavaScript boolean expression over the element bound to `n`; the
    /// query scope element must be bound to `scope`.
    pub fn to_js_predicate(&self) -> String {
        self.js_for("n")
    }

    fn js_for(&self, var: &str) -> String {
        match self {
            Locator::Tag(name) => format!("({}.localName === {})", var, js_string(name)),
            Locator::Role(role) => format!(
                "({}.getAttribute('role') === {})",
                var,
                js_string(role)
            ),
            Locator::AriaLabelPrefix(prefix) => format!(
                "(({}.getAttribute('aria-label') || '').startsWith({}))",
                var,
                js_string(prefix)
            ),
            Locator::Text(text) => format!(
                "(!!{v}.firstChild && {v}.firstChild.nodeType === 3 && {v}.textContent.trim().toLowerCase() === {t})",
                v = var,
                t = js_string(&text.trim().to_lowercase())
            ),
            Locator::TextPrefix(prefix) => format!(
                "({v}.textContent.length > {len} && {v}.textContent.startsWith({p}))",
                v = var,
                len = prefix.chars().count(),
                p = js_string(prefix)
            ),
            Locator::Marker(name) => format!("{}.hasAttribute({})", var, js_string(name)),
            Locator::Not(inner) => format!("!{}", inner.js_for(var)),
            Locator::All(parts) if parts.is_empty() => "true".to_string(),
            Locator::All(parts) => format!(
                "({})",
                parts
                    .iter()
                    .map(|p| p.js_for(var))
                    .collect::<Vec<_>>()
                    .join(" && ")
            ),
            Locator::Any(parts) if parts.is_empty() => "false".to_string(),
            Locator::Any(parts) => format!(
                "({})",
                parts
                    .iter()
                    .map(|p| p.js_for(var))
                    .collect::<Vec<_>>()
                    .join(" || ")
            ),
            Locator::Within(ancestor, node) => {
                let a = format!("{}_a", var);
                format!(
                    "({node} && ((() => {{ let {a} = {v}.parentElement; while ({a} && {a} !== scope) {{ if ({anc}) return true; {a} = {a}.parentElement; }} return false; }})()))",
                    node = node.js_for(var),
                    a = a,
                    v = var,
                    anc = ancestor.js_for(&a)
                )
            }
            Locator::Child(parent, node) => {
                let p = format!("{}_p", var);
                format!(
                    "({node} && ((() => {{ const {p} = {v}.parentElement; return !!{p} && {p} !== scope && {par}; }})()))",
                    node = node.js_for(var),
                    p = p,
                    v = var,
                    par = parent.js_for(&p)
                )
            }
        }
    }
}

fn js_string(value: &str) -> String {
    // A JSON string literal is a valid JavaScript string literal.
    serde_json::Value::String(value.to_string()).to_string()
}
