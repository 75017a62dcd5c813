//! Hand-off to the external template renderer.

use std::sync::Arc;

use async_trait::async_trait;
use rollgate_core::Host;
use tracing::debug;

use crate::error::{ExecError, ExecResult};
use crate::executor::{CommandExecutor, shell_quote};

/// Materializes a template on a host from a JSON context.
#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    async fn render(
        &self,
        host: &Host,
        template: &str,
        destination: &str,
        context: &serde_json::Value,
    ) -> ExecResult<()>;
}

/// Pipes the context into a render command on the target host:
/// `printf '%s' <json> | <render_command> <template> <destination>`.
pub struct ExecRenderer {
    executor: Arc<dyn CommandExecutor>,
    render_command: String,
}

impl ExecRenderer {
    pub fn new(executor: Arc<dyn CommandExecutor>, render_command: impl Into<String>) -> Self {
        Self {
            executor,
            render_command: render_command.into(),
        }
    }

    pub fn command_line(&self, template: &str, destination: &str, context: &serde_json::Value) -> String {
        format!(
            "printf '%s' {} | {} {} {}",
            shell_quote(&context.to_string()),
            self.render_command,
            shell_quote(template),
            shell_quote(destination)
        )
    }
}

#[async_trait]
impl TemplateRenderer for ExecRenderer {
    async fn render(
        &self,
        host: &Host,
        template: &str,
        destination: &str,
        context: &serde_json::Value,
    ) -> ExecResult<()> {
        let command = self.command_line(template, destination, context);
        self.executor
            .run_checked(host, &command)
            .await
            .map_err(|e| ExecError::Template {
                host: host.to_string(),
                template: template.to_string(),
                destination: destination.to_string(),
                reason: e.to_string(),
            })?;
        debug!(%host, template, destination, "template rendered");
        Ok(())
    }
}

/// Leaves configuration files as they are.
#[derive(Debug, Clone, Default)]
pub struct SkipRenderer;

#[async_trait]
impl TemplateRenderer for SkipRenderer {
    async fn render(
        &self,
        host: &Host,
        template: &str,
        destination: &str,
        _context: &serde_json::Value,
    ) -> ExecResult<()> {
        debug!(%host, template, destination, "no renderer configured, skipping");
        Ok(())
    }
}

/// The renderer configured for a platform.
pub fn renderer_for(
    executor: Arc<dyn CommandExecutor>,
    render_command: Option<&str>,
) -> Arc<dyn TemplateRenderer> {
    match render_command {
        Some(cmd) => Arc::new(ExecRenderer::new(executor, cmd)),
        None => Arc::new(SkipRenderer),
    }
}
