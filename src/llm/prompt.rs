//! Prompt template with a `{ticket_text}` placeholder.

use std::path::Path;

use tracing::{info, warn};

const PLACEHOLDER: &str = "{ticket_text}";

const DEFAULT_TEMPLATE: &str = "You extract technical skills from IT service tickets.\n\
Read the ticket below and list the distinct technical skills a technician needed to resolve it \
(products, protocols, platforms, tools).\n\
Respond with JSON only, in the form {\"skills\": [\"Skill One\", \"Skill Two\"]}. \
Use an empty list if no technical skill applies.\n\n\
Ticket:\n{ticket_text}\n";

#[derive(Debug, Clone)]
pub struct PromptTemplate {
    template: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

impl PromptTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// Load a template file, falling back to the built-in template when the
    /// file is missing or has no placeholder.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(template) if template.contains(PLACEHOLDER) => {
                info!(path = %path.display(), "loaded prompt template");
                Self { template }
            }
            Ok(_) => {
                warn!(path = %path.display(), "prompt template has no {PLACEHOLDER} placeholder, using built-in");
                Self::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "prompt template unreadable, using built-in");
                Self::default()
            }
        }
    }

    pub fn render(&self, ticket_text: &str) -> String {
        self.template.replace(PLACEHOLDER, ticket_text)
    }
}
