//! AMQP message queue tool handler (RabbitMQ via lapin).
//!
//! `mq://<service>/<exchange>/<routing-key>` publishes the args payload.
//! On the first publish to a target this process declares the queue,
//! declares a durable topic exchange and binds them on the routing key;
//! declaration failures are logged but do not abort the publish. Publisher
//! confirms are enabled and a broker ack is the only success signal.
//! Messages are persistent (`delivery_mode = 2`).

use crate::error::{ToolError, ToolResult};
use crate::registry::{ToolHandler, ToolMetadata};
use crate::{HandleCache, InvokeContext};
use async_trait::async_trait;
use dashmap::DashMap;
use lapin::options::{
    BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;

const PERSISTENT: u8 = 2;

#[derive(Debug, Clone, Deserialize)]
pub struct MqConfig {
    pub url: String,
    /// Default exchange when the URI names only a routing key.
    #[serde(default)]
    pub exchange: Option<String>,
}

pub struct MqHandler {
    channels: HandleCache<Arc<Channel>>,
    /// Targets already declared in this process: `exchange/queue`.
    declared: DashMap<String, ()>,
}

impl Default for MqHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl MqHandler {
    pub fn new() -> Self {
        Self {
            channels: HandleCache::default(),
            declared: DashMap::new(),
        }
    }

    async fn channel(
        &self,
        tenant: &str,
        service: &str,
        config: &MqConfig,
    ) -> ToolResult<Arc<Channel>> {
        let key = HandleCache::<Arc<Channel>>::key(tenant, service);
        let url = config.url.clone();
        self.channels
            .get_or_create(&key, || async move {
                let connection = Connection::connect(&url, ConnectionProperties::default())
                    .await
                    .map_err(|e| ToolError::Connection(e.to_string()))?;
                let channel = connection
                    .create_channel()
                    .await
                    .map_err(|e| ToolError::Connection(e.to_string()))?;
                channel
                    .confirm_select(ConfirmSelectOptions::default())
                    .await
                    .map_err(|e| ToolError::Connection(e.to_string()))?;
                Ok(Arc::new(channel))
            })
            .await
    }

    /// Declare queue + exchange + binding once per process per target.
    /// Failures here are logged only; the broker may already own the
    /// topology with different options.
    async fn ensure_topology(&self, channel: &Channel, exchange: &str, routing_key: &str) {
        let key = format!("{}/{}", exchange, routing_key);
        if self.declared.contains_key(&key) {
            return;
        }

        if let Err(e) = channel
            .queue_declare(
                routing_key,
                QueueDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            tracing::warn!(exchange, routing_key, error = %e, "queue declare failed");
        }

        if let Err(e) = channel
            .exchange_declare(
                exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
        {
            tracing::warn!(exchange, error = %e, "exchange declare failed");
        }

        if let Err(e) = channel
            .queue_bind(
                routing_key,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            tracing::warn!(exchange, routing_key, error = %e, "queue bind failed");
        }

        self.declared.insert(key, ());
    }
}

/// Split the URI path into `(exchange, routing_key)`.
pub fn parse_target(path: &str, default_exchange: Option<&str>) -> ToolResult<(String, String)> {
    let parts: Vec<&str> = path.splitn(2, '/').filter(|p| !p.is_empty()).collect();
    match parts.as_slice() {
        [exchange, routing_key] => Ok((exchange.to_string(), routing_key.to_string())),
        [routing_key] => match default_exchange {
            Some(exchange) => Ok((exchange.to_string(), routing_key.to_string())),
            None => Err(ToolError::InvalidUri(format!(
                "mq path '{}' needs an exchange (no default configured)",
                path
            ))),
        },
        _ => Err(ToolError::InvalidUri("empty mq path".to_string())),
    }
}

#[async_trait]
impl ToolHandler for MqHandler {
    async fn invoke(
        &self,
        service: &str,
        config: &Value,
        path: &str,
        args: Value,
        ctx: &InvokeContext,
    ) -> ToolResult<Value> {
        let config: MqConfig = serde_json::from_value(config.clone())
            .map_err(|e| ToolError::InvalidArgument(format!("invalid mq config: {}", e)))?;

        let (exchange, routing_key) = parse_target(path, config.exchange.as_deref())?;

        // The message body: `message` if present, otherwise the whole args.
        let payload = match args.get("message") {
            Some(message) => serde_json::to_vec(message),
            None => serde_json::to_vec(&args),
        }
        .map_err(|e| ToolError::InvalidArgument(e.to_string()))?;

        let channel = self.channel(&ctx.tenant_id, service, &config).await?;
        self.ensure_topology(&channel, &exchange, &routing_key).await;

        if ctx.cancel.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        let confirm = channel
            .basic_publish(
                &exchange,
                &routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(PERSISTENT),
            )
            .await
            .map_err(|e| ToolError::Connection(e.to_string()))?
            .await
            .map_err(|e| ToolError::Connection(e.to_string()))?;

        // Publisher confirms are on: only a broker ack counts as success.
        if !matches!(confirm, Confirmation::Ack(_)) {
            return Err(ToolError::Execution(format!(
                "publish to {}/{} not acked",
                exchange, routing_key
            )));
        }

        Ok(serde_json::json!({
            "ack": true,
            "exchange": exchange,
            "routingKey": routing_key,
            "bytes": payload.len(),
        }))
    }

    fn metadata(&self) -> ToolMetadata {
        ToolMetadata {
            name: "mq".to_string(),
            description: "AMQP publishing with confirms and persistent delivery".to_string(),
        }
    }

    async fn shutdown(&self) {
        self.channels.drain();
        self.declared.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target() {
        assert_eq!(
            parse_target("orders/order.created", None).unwrap(),
            ("orders".to_string(), "order.created".to_string())
        );
        assert_eq!(
            parse_target("order.created", Some("events")).unwrap(),
            ("events".to_string(), "order.created".to_string())
        );
        assert!(parse_target("order.created", None).is_err());
        assert!(parse_target("", Some("events")).is_err());
    }
}
