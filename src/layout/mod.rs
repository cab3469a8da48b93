pub mod registry;

pub use registry::LayoutRegistry;

use crate::dom::Locator;
use crate::types::RunMode;
use serde::{Deserialize, Serialize};

/// Marker put on a target that failed or was skipped.
pub const INELIGIBLE_MARKER: &str = "data-dmsweeper-ignore";
/// Marker put on a target once its workflow completed.
pub const PROCESSED_MARKER: &str = "data-dmsweeper-processed";

/// Vocabulary for one host layout / locale.
///
/// A layout is plain configuration: where the conversation lives, how rows,
/// affordances, menus and dialogs are recognised. The engine never branches
/// on which layout it was given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    pub name: String,
    /// Language tags served by this layout, matched by primary subtag.
    pub languages: Vec<String>,
    /// Scrollable container holding the message rows.
    pub messages_root: Locator,
    pub row: Locator,
    /// Rows sent by the account running the tool.
    pub authored_by_self: Locator,
    /// Hover affordance that opens the per-message menu.
    pub reveal_control: Locator,
    pub unsend_label: String,
    pub delete_label: String,
    /// Actionable control inside the confirmation dialog.
    pub confirm_control: Locator,
    pub loader: Locator,
    /// Only rendered once the very start of the conversation is loaded.
    pub top_marker: Locator,
}

impl Layout {
    pub fn english() -> Self {
        Self::with_labels(
            "instagram-en",
            &["en"],
            "See more options for message",
            "Unsend",
            "Delete",
            "You",
        )
    }

    pub fn french() -> Self {
        Self::with_labels(
            "instagram-fr",
            &["fr"],
            "Voir plus d’options pour le message",
            "Annuler l’envoi",
            "Supprimer",
            "Vous",
        )
    }

    fn with_labels(
        name: &str,
        languages: &[&str],
        reveal_prefix: &str,
        unsend_label: &str,
        delete_label: &str,
        self_prefix: &str,
    ) -> Self {
        let messages_root = Locator::child_chain(vec![
            Locator::tag("div").and(Locator::role("grid")),
            Locator::tag("div"),
            Locator::tag("div"),
            Locator::tag("div"),
            Locator::tag("div"),
        ])
        .unwrap_or_else(|| Locator::role("grid"));

        Self {
            name: name.to_string(),
            languages: languages.iter().map(|l| l.to_string()).collect(),
            messages_root,
            row: Locator::tag("div").and(Locator::role("row")),
            authored_by_self: Locator::text_prefix(self_prefix),
            reveal_control: Locator::aria_label_prefix(reveal_prefix),
            unsend_label: unsend_label.to_string(),
            delete_label: delete_label.to_string(),
            confirm_control: Locator::tag("button").within(Locator::role("dialog")),
            loader: Locator::role("progressbar"),
            top_marker: Locator::tag("a").and(Locator::role("link")).and(
                Locator::aria_label_prefix("Profile"),
            ),
        }
    }

    /// Menu entry carrying the action of `mode`.
    pub fn menu_item(&self, mode: RunMode) -> Locator {
        let label = match mode {
            RunMode::Unsend => &self.unsend_label,
            RunMode::Delete => &self.delete_label,
        };
        Locator::Any(vec![Locator::tag("span"), Locator::tag("div")]).and(Locator::text(label))
    }

    /// Rows the engine may still act on: own, not yet marked.
    pub fn eligible_row(&self) -> Locator {
        self.row
            .clone()
            .and(self.authored_by_self.clone())
            .and(Locator::marker(INELIGIBLE_MARKER).not())
            .and(Locator::marker(PROCESSED_MARKER).not())
    }

    pub fn serves(&self, language: &str) -> bool {
        let primary = language
            .split(['-', '_'])
            .next()
            .unwrap_or(language)
            .to_ascii_lowercase();
        self.languages.iter().any(|l| l.eq_ignore_ascii_case(&primary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serves_by_primary_subtag() {
        let layout = Layout::french();
        assert!(layout.serves("fr-CA"));
        assert!(layout.serves("FR"));
        assert!(!layout.serves("en-US"));
    }

    #[test]
    fn menu_item_follows_mode() {
        let layout = Layout::english();
        let unsend = format!("{:?}", layout.menu_item(RunMode::Unsend));
        let delete = format!("{:?}", layout.menu_item(RunMode::Delete));
        assert!(unsend.contains("Unsend"));
        assert!(delete.contains("Delete"));
    }

    #[test]
    fn eligible_rows_exclude_both_markers() {
        let js = Layout::english().eligible_row().to_js_predicate();
        assert!(js.contains(INELIGIBLE_MARKER));
        assert!(js.contains(PROCESSED_MARKER));
    }
}
