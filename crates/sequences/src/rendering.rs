//! Message content rendering.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use campaign_core::{CampaignError, CampaignResult};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::recipients::Recipient;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedMessage {
    pub subject: String,
    pub body: String,
}

/// Must be side-effect free: a crashed worker may render the same step twice.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, content_ref: &str, recipient: &Recipient) -> CampaignResult<RenderedMessage>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentTemplate {
    pub subject: String,
    pub body: String,
}

/// Renderer over registered templates using `{{variable}}` syntax.
/// Placeholders with no value are left as written.
#[derive(Clone, Default)]
pub struct TemplateRenderer {
    templates: Arc<DashMap<String, ContentTemplate>>,
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        content_ref: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) {
        self.templates.insert(
            content_ref.into(),
            ContentTemplate {
                subject: subject.into(),
                body: body.into(),
            },
        );
    }

    /// Fills `{{key}}` and `{{ key }}` placeholders in one left-to-right
    /// pass. Substituted values are never scanned again.
    pub fn substitute(template: &str, variables: &HashMap<String, String>) -> String {
        let mut rendered = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find("{{") {
            rendered.push_str(&rest[..open]);
            let after_open = &rest[open + 2..];
            let Some(close) = after_open.find("}}") else {
                rest = &rest[open..];
                break;
            };
            let placeholder = &rest[open..open + 2 + close + 2];
            match variables.get(after_open[..close].trim()) {
                Some(value) => rendered.push_str(value),
                None => rendered.push_str(placeholder),
            }
            rest = &after_open[close + 2..];
        }
        rendered.push_str(rest);
        rendered
    }

    fn variables(recipient: &Recipient) -> HashMap<String, String> {
        let mut variables = recipient.attributes.clone();
        variables.insert("email".to_string(), recipient.email.clone());
        variables.insert("recipient_id".to_string(), recipient.id.clone());
        variables
    }
}

#[async_trait]
impl Renderer for TemplateRenderer {
    async fn render(&self, content_ref: &str, recipient: &Recipient) -> CampaignResult<RenderedMessage> {
        let template = self
            .templates
            .get(content_ref)
            .map(|t| t.clone())
            .ok_or_else(|| CampaignError::Render(format!("no template for '{content_ref}'")))?;
        let variables = Self::variables(recipient);
        Ok(RenderedMessage {
            subject: Self::substitute(&template.subject, &variables),
            body: Self::substitute(&template.body, &variables),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_render_substitutes_known_placeholders() {
        let renderer = TemplateRenderer::new();
        renderer.register(
            "welcome",
            "Welcome, {{first_name}}!",
            "Hi {{ first_name }}, we'll write to {{email}}. Code: {{promo_code}}",
        );
        let recipient =
            Recipient::new("r1", "ada@example.com").with_attribute("first_name", "Ada");

        let message = renderer.render("welcome", &recipient).await.unwrap();
        assert_eq!(message.subject, "Welcome, Ada!");
        assert_eq!(
            message.body,
            "Hi Ada, we'll write to ada@example.com. Code: {{promo_code}}"
        );
    }

    #[test]
    fn test_substituted_values_are_not_expanded() {
        let mut variables = HashMap::new();
        variables.insert("first_name".to_string(), "{{email}}".to_string());
        variables.insert("email".to_string(), "ada@example.com".to_string());

        assert_eq!(
            TemplateRenderer::substitute("Hi {{first_name}} at {{ email }}", &variables),
            "Hi {{email}} at ada@example.com"
        );
        assert_eq!(
            TemplateRenderer::substitute("open {{email and {{missing}}", &variables),
            "open {{email and {{missing}}"
        );
    }

    #[tokio::test]
    async fn test_unknown_content_is_render_error() {
        let renderer = TemplateRenderer::new();
        let recipient = Recipient::new("r1", "ada@example.com");
        let err = renderer.render("missing", &recipient).await.unwrap_err();
        assert!(matches!(err, CampaignError::Render(_)));
    }
}
