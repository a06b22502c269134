//! Event Buffer Protocol (C5)
//!
//! Thin wrapper over the store-side notification-buffer procedures: drain
//! the persistent buffer for a channel, and acknowledge (delete) processed
//! payloads (spec.md §4.5). The acknowledgement key (`event_fetch_key`) is
//! a single global config value and must never be conflated with a
//! domain's `fetch_key`, which is only used for keyed row fetches (C1).

use crate::gateway::{GatewayError, StoreGateway};
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait EventBufferProtocol: Send + Sync {
    /// `get_event_notification_buffer(channel)`, extracting the `payload`
    /// column in fetch order.
    async fn drain_pending(&self, channel: &str) -> Result<Vec<String>, GatewayError>;

    /// `clean_event_notification_buffer({event_fetch_key: payloads}, channel)`,
    /// committed.
    async fn acknowledge(&self, channel: &str, payloads: &[String]) -> Result<(), GatewayError>;
}

pub struct PgEventBufferProtocol {
    gateway: Arc<dyn StoreGateway>,
    get_procedure: String,
    clean_procedure: String,
    event_fetch_key: String,
}

impl PgEventBufferProtocol {
    pub fn new(
        gateway: Arc<dyn StoreGateway>,
        get_procedure: String,
        clean_procedure: String,
        event_fetch_key: String,
    ) -> Self {
        Self {
            gateway,
            get_procedure,
            clean_procedure,
            event_fetch_key,
        }
    }
}

#[async_trait]
impl EventBufferProtocol for PgEventBufferProtocol {
    async fn drain_pending(&self, channel: &str) -> Result<Vec<String>, GatewayError> {
        let batch = self
            .gateway
            .call(
                &self.get_procedure,
                vec![serde_json::Value::String(channel.to_string())],
            )
            .await?;

        let payload_idx = batch
            .columns
            .iter()
            .position(|c| c == "payload")
            .unwrap_or(0);

        let mut payloads = Vec::with_capacity(batch.rows.len());
        for row in &batch.rows {
            if let Some(crate::normalize::RawCell::Text(s)) = row.get(payload_idx) {
                payloads.push(s.clone());
            }
        }
        Ok(payloads)
    }

    async fn acknowledge(&self, channel: &str, payloads: &[String]) -> Result<(), GatewayError> {
        let json_data = serde_json::json!({ &self.event_fetch_key: payloads });
        self.gateway
            .call_void(
                &self.clean_procedure,
                vec![json_data, serde_json::Value::String(channel.to_string())],
            )
            .await
    }
}
