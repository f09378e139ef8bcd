//! Handlebars rendering of node configuration templates

use std::fs;
use std::path::Path;

use handlebars::{Context, Handlebars, Helper, HelperResult, Output, RenderContext};
use serde::Serialize;

use crate::{Error, Result};

/// Suffix marking a template file
pub const TEMPLATE_SUFFIX: &str = ".hbs";

/// Template rendered once per WireGuard link
pub const LINK_TEMPLATE: &str = "tlwg.conf.hbs";

/// Renders configuration templates; output is never HTML-escaped
pub struct TemplateRenderer {
    handlebars: Handlebars<'static>,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();
        handlebars.set_strict_mode(false);
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars.register_helper("join", Box::new(join_helper));
        Self { handlebars }
    }

    /// Render template source; `name` only labels errors
    pub fn render_str<T: Serialize>(&self, name: &str, source: &str, data: &T) -> Result<String> {
        self.handlebars
            .render_template(source, data)
            .map_err(|e| Error::Template {
                template: name.to_string(),
                message: e.to_string(),
            })
    }

    /// Render the template at `source` into `dest`
    pub fn render_file<T: Serialize>(&self, source: &Path, dest: &Path, data: &T) -> Result<()> {
        let template = fs::read_to_string(source)?;
        let rendered = self.render_str(&source.display().to_string(), &template, data)?;
        fs::write(dest, rendered)?;
        Ok(())
    }
}

/// `{{join list ", "}}`; separator defaults to a space
fn join_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let empty_vec = Vec::new();
    let array = h
        .param(0)
        .and_then(|v| v.value().as_array())
        .unwrap_or(&empty_vec);

    let separator = h.param(1).and_then(|v| v.value().as_str()).unwrap_or(" ");

    let result: Vec<String> = array
        .iter()
        .map(|v| match v.as_str() {
            Some(s) => s.to_string(),
            None => v.to_string(),
        })
        .collect();

    out.write(&result.join(separator))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_and_no_escaping() {
        let renderer = TemplateRenderer::new();
        let out = renderer
            .render_str(
                "t",
                "AllowedIPs = {{join wg_peer_allowedips \", \"}}\nKey = {{key}}",
                &json!({"wg_peer_allowedips": ["0.0.0.0/0", "::/0"], "key": "a+b/c="}),
            )
            .unwrap();
        assert_eq!(out, "AllowedIPs = 0.0.0.0/0, ::/0\nKey = a+b/c=");
    }

    #[test]
    fn test_syntax_error_names_template() {
        let renderer = TemplateRenderer::new();
        let err = renderer
            .render_str("bird.conf.hbs", "{{#if}", &json!({}))
            .unwrap_err();
        assert!(err.to_string().contains("bird.conf.hbs"));
    }
}
