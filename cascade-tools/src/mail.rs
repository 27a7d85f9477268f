//! SMTP mail tool handler (lettre).
//!
//! `mail://<service>/send` sends `{to, subject, body}`;
//! `mail://<service>/template` renders a configured template with
//! `${placeholder}` substitution from `params` before sending.

use crate::error::{ToolError, ToolResult};
use crate::registry::{ToolHandler, ToolMetadata};
use crate::{HandleCache, InvokeContext};
use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
pub struct MailConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    /// Named templates: `{subject, body}` with `${var}` placeholders.
    #[serde(default)]
    pub templates: HashMap<String, MailTemplate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MailTemplate {
    pub subject: String,
    pub body: String,
}

fn default_smtp_port() -> u16 {
    465
}

/// Substitute `${name}` placeholders from a parameter object.
pub fn render_template(template: &str, params: &Value) -> String {
    let mut out = template.to_string();
    if let Value::Object(params) = params {
        for (name, value) in params {
            let needle = format!("${{{}}}", name);
            let replacement = match value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            out = out.replace(&needle, &replacement);
        }
    }
    out
}

pub struct MailHandler {
    transports: HandleCache<AsyncSmtpTransport<Tokio1Executor>>,
}

impl Default for MailHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl MailHandler {
    pub fn new() -> Self {
        Self {
            transports: HandleCache::default(),
        }
    }

    async fn transport(
        &self,
        tenant: &str,
        service: &str,
        config: &MailConfig,
    ) -> ToolResult<AsyncSmtpTransport<Tokio1Executor>> {
        let key = HandleCache::<AsyncSmtpTransport<Tokio1Executor>>::key(tenant, service);
        let config = config.clone();
        self.transports
            .get_or_create(&key, || async move {
                AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                    .map(|builder| {
                        builder
                            .port(config.port)
                            .credentials(Credentials::new(
                                config.username.clone(),
                                config.password.clone(),
                            ))
                            .build()
                    })
                    .map_err(|e| ToolError::Connection(e.to_string()))
            })
            .await
    }
}

#[async_trait]
impl ToolHandler for MailHandler {
    async fn invoke(
        &self,
        service: &str,
        config: &Value,
        path: &str,
        args: Value,
        ctx: &InvokeContext,
    ) -> ToolResult<Value> {
        let config: MailConfig = serde_json::from_value(config.clone())
            .map_err(|e| ToolError::InvalidArgument(format!("invalid mail config: {}", e)))?;

        let (subject, body) = match path {
            "template" => {
                let name = args
                    .get("template")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ToolError::InvalidArgument("template send requires 'template'".to_string())
                    })?;
                let template = config.templates.get(name).ok_or_else(|| {
                    ToolError::ToolNotFound(format!("mail template '{}'", name))
                })?;
                let params = args.get("params").cloned().unwrap_or(Value::Null);
                (
                    render_template(&template.subject, &params),
                    render_template(&template.body, &params),
                )
            }
            _ => {
                let subject = args
                    .get("subject")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let body = args
                    .get("body")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                (subject, body)
            }
        };

        let recipients: Vec<String> = match args.get("to") {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => {
                return Err(ToolError::InvalidArgument(
                    "mail requires 'to'".to_string(),
                ));
            }
        };
        if recipients.is_empty() {
            return Err(ToolError::InvalidArgument("empty recipient list".to_string()));
        }

        let mut builder = Message::builder()
            .from(
                config
                    .from
                    .parse()
                    .map_err(|_| ToolError::InvalidArgument("invalid from address".to_string()))?,
            )
            .subject(subject.clone());
        for to in &recipients {
            builder = builder.to(to
                .parse()
                .map_err(|_| ToolError::InvalidArgument(format!("invalid address {}", to)))?);
        }
        let message = builder
            .body(body)
            .map_err(|e| ToolError::InvalidArgument(e.to_string()))?;

        if ctx.cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        let transport = self.transport(&ctx.tenant_id, service, &config).await?;
        transport
            .send(message)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        Ok(serde_json::json!({
            "sent": true,
            "to": recipients,
            "subject": subject,
        }))
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            name: "mail".to_string(),
            description: "Template-driven SMTP sending".to_string(),
        }
    }

    async fn shutdown(&self) {
        self.transports.drain();
    }
}
