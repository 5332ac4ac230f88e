//! Final output shaping.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use stepweave_types::flow::{OutputSpec, ShapedBody, ShapedOutput};

use super::error::EngineError;
use super::expression::{ExpressionResolver, stringify};

/// Turns the final expression context and a declarative [`OutputSpec`]
/// into a response.
pub trait OutputResolver: Send + Sync {
    /// `last_output` is the run's default output, used when the output declaration has
    /// no body.
    fn shape(
        &self,
        spec: &OutputSpec,
        context: &Value,
        last_output: &Value,
    ) -> Result<ShapedOutput, EngineError>;
}

/// Resolves every template field of the output declaration through an
/// [`ExpressionResolver`].
#[derive(Clone)]
pub struct TemplateOutputResolver {
    resolver: Arc<dyn ExpressionResolver>,
}

impl TemplateOutputResolver {
    pub fn new(resolver: Arc<dyn ExpressionResolver>) -> Self {
        Self { resolver }
    }

    fn resolve_string(&self, template: &str, context: &Value) -> Result<String, EngineError> {
        self.resolver
            .resolve_str(template, context)
            .map(|v| stringify(&v))
            .map_err(|e| EngineError::expression("output", e))
    }
}

impl OutputResolver for TemplateOutputResolver {
    fn shape(
        &self,
        spec: &OutputSpec,
        context: &Value,
        last_output: &Value,
    ) -> Result<ShapedOutput, EngineError> {
        let body = match (&spec.raw_body, &spec.body) {
            (Some(raw), _) => ShapedBody::Raw(self.resolve_string(raw, context)?),
            (None, Some(template)) => ShapedBody::Json(
                self.resolver
                    .resolve(template, context)
                    .map_err(|e| EngineError::expression("output", e))?,
            ),
            (None, None) => ShapedBody::Json(last_output.clone()),
        };

        let mut headers = BTreeMap::new();
        for (name, template) in &spec.headers {
            headers.insert(name.clone(), self.resolve_string(template, context)?);
        }

        let redirect = spec
            .redirect
            .as_deref()
            .map(|r| self.resolve_string(r, context))
            .transpose()?;

        Ok(ShapedOutput {
            body,
            status: spec.status,
            headers,
            redirect,
            format: spec.format.clone(),
        })
    }
}
