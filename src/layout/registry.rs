use crate::core::Document;
use crate::errors::Result;
use crate::layout::Layout;
use std::sync::Arc;
use tracing::debug;

/// Registry of known layouts, looked up by the language the document declares.
pub struct LayoutRegistry {
    layouts: Vec<Arc<Layout>>,
    fallback: Arc<Layout>,
}

impl LayoutRegistry {
    pub fn new(fallback: Layout) -> Self {
        let fallback = Arc::new(fallback);
        Self {
            layouts: vec![fallback.clone()],
            fallback,
        }
    }

    /// Registers a layout; later registrations take precedence.
    pub fn register(&mut self, layout: Layout) {
        self.layouts.insert(0, Arc::new(layout));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Layout>> {
        self.layouts.iter().find(|l| l.name == name).cloned()
    }

    pub fn list_layouts(&self) -> Vec<String> {
        self.layouts.iter().map(|l| l.name.clone()).collect()
    }

    pub fn for_language(&self, language: Option<&str>) -> Arc<Layout> {
        language
            .and_then(|lang| self.layouts.iter().find(|l| l.serves(lang)))
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    /// Picks the layout for the language `document` declares, or for
    /// `fallback_language` when it declares none.
    pub async fn detect(
        &self,
        document: &dyn Document,
        fallback_language: &str,
    ) -> Result<Arc<Layout>> {
        let declared = document.language().await?;
        let language = declared.as_deref().unwrap_or(fallback_language);
        let layout = self.for_language(Some(language));
        debug!(language, layout = %layout.name, "layout selected");
        Ok(layout)
    }
}

impl Default for LayoutRegistry {
    fn default() -> Self {
        let mut registry = Self::new(Layout::english());
        registry.register(Layout::french());
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::MemoryDocument;

    #[test]
    fn falls_back_for_unknown_languages() {
        let registry = LayoutRegistry::default();
        assert_eq!(registry.for_language(Some("de")).name, "instagram-en");
        assert_eq!(registry.for_language(None).name, "instagram-en");
        assert_eq!(registry.for_language(Some("fr-FR")).name, "instagram-fr");
    }

    #[test]
    fn later_registrations_win() {
        let mut registry = LayoutRegistry::default();
        let mut custom = Layout::english();
        custom.name = "custom-en".to_string();
        registry.register(custom);
        assert_eq!(registry.for_language(Some("en")).name, "custom-en");
        assert!(registry.get("instagram-fr").is_some());
        assert_eq!(registry.list_layouts().len(), 3);
    }

    #[tokio::test]
    async fn detects_from_document_language() {
        let registry = LayoutRegistry::default();
        let doc = MemoryDocument::new();
        assert_eq!(registry.detect(&doc, "fr").await.unwrap().name, "instagram-fr");
        doc.set_language(Some("en-GB"));
        assert_eq!(registry.detect(&doc, "fr").await.unwrap().name, "instagram-en");
    }
}
