//! Test doubles shared across component unit tests. Not compiled into the
//! release binary.

use crate::gateway::{GatewayError, StoreGateway};
use crate::normalize::{RawCell, RawRowBatch};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::sync::Mutex;

/// An in-memory stand-in for [`StoreGateway`] that models just enough of
/// the store's contract to exercise C5/C6/C7 without a live Postgres
/// instance: a persistent notification buffer keyed by payload, a
/// `get_by_id` row table keyed by payload, a single override window, and a
/// full-table row set.
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    event_buffer: Vec<String>,
    rows_by_payload: std::collections::HashMap<String, Vec<RawCell>>,
    full_rows: Vec<Vec<RawCell>>,
    override_window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    override_archived: bool,
    calls: Vec<String>,
    fail_next: Option<GatewayError>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_event_buffer(&self, payloads: Vec<String>) {
        self.state.lock().unwrap().event_buffer = payloads;
    }

    pub fn seed_row(&self, payload: &str, columns: Vec<RawCell>) {
        self.state
            .lock()
            .unwrap()
            .rows_by_payload
            .insert(payload.to_string(), columns);
    }

    pub fn seed_full_rows(&self, rows: Vec<Vec<RawCell>>) {
        self.state.lock().unwrap().full_rows = rows;
    }

    pub fn seed_override(&self, source: DateTime<Utc>, target: DateTime<Utc>) {
        self.state.lock().unwrap().override_window = Some((source, target));
    }

    pub fn override_archived(&self) -> bool {
        self.state.lock().unwrap().override_archived
    }

    pub fn event_buffer_remaining(&self) -> Vec<String> {
        self.state.lock().unwrap().event_buffer.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Arrange for the next call of any kind to fail with `err`.
    pub fn fail_next_call(&self, err: GatewayError) {
        self.state.lock().unwrap().fail_next = Some(err);
    }

    fn take_failure(&self) -> Option<GatewayError> {
        self.state.lock().unwrap().fail_next.take()
    }
}

#[async_trait]
impl StoreGateway for FakeGateway {
    async fn call_get_all(
        &self,
        procedure: &str,
        _window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<RawRowBatch, GatewayError> {
        self.state.lock().unwrap().calls.push(procedure.to_string());
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let rows = self.state.lock().unwrap().full_rows.clone();
        Ok(RawRowBatch {
            columns: vec!["col0".into()],
            rows,
        })
    }

    async fn call_get_by_id(
        &self,
        procedure: &str,
        _fetch_key: &str,
        payloads: &[String],
    ) -> Result<RawRowBatch, GatewayError> {
        self.state.lock().unwrap().calls.push(procedure.to_string());
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let state = self.state.lock().unwrap();
        let rows: Vec<Vec<RawCell>> = payloads
            .iter()
            .filter_map(|p| state.rows_by_payload.get(p).cloned())
            .collect();
        Ok(RawRowBatch {
            columns: vec!["payload".into(), "value".into()],
            rows,
        })
    }

    async fn call(&self, procedure: &str, args: Vec<JsonValue>) -> Result<RawRowBatch, GatewayError> {
        self.state.lock().unwrap().calls.push(procedure.to_string());
        if let Some(err) = self.take_failure() {
            return Err(err);
        }

        if procedure == "get_event_notification_buffer" {
            let state = self.state.lock().unwrap();
            let rows = state
                .event_buffer
                .iter()
                .enumerate()
                .map(|(i, payload)| {
                    vec![
                        RawCell::Integer(i as i64),
                        RawCell::Text("channel_a".to_string()),
                        RawCell::Text(payload.clone()),
                    ]
                })
                .collect();
            return Ok(RawRowBatch {
                columns: vec!["id".into(), "channel".into(), "payload".into()],
                rows,
            });
        }

        if procedure == "get_index_override" {
            let state = self.state.lock().unwrap();
            let domain = args
                .first()
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let _ = domain;
            return match state.override_window {
                Some((source, target)) => Ok(RawRowBatch {
                    columns: vec!["source_ts".into(), "target_ts".into()],
                    rows: vec![vec![RawCell::Timestamp(source), RawCell::Timestamp(target)]],
                }),
                None => Ok(RawRowBatch {
                    columns: vec!["source_ts".into(), "target_ts".into()],
                    rows: vec![],
                }),
            };
        }

        Ok(RawRowBatch {
            columns: vec![],
            rows: vec![],
        })
    }

    async fn call_void(&self, procedure: &str, args: Vec<JsonValue>) -> Result<(), GatewayError> {
        self.state.lock().unwrap().calls.push(procedure.to_string());
        if let Some(err) = self.take_failure() {
            return Err(err);
        }

        if procedure == "clean_event_notification_buffer" {
            let ack_payloads: Vec<String> = args
                .first()
                .and_then(|v| v.as_object())
                .and_then(|m| m.values().next())
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            let mut state = self.state.lock().unwrap();
            state
                .event_buffer
                .retain(|p| !ack_payloads.contains(p));
        }

        if procedure == "clean_index_override" {
            self.state.lock().unwrap().override_archived = true;
        }

        Ok(())
    }
}

use crate::index::IndexClient;
use serde_json::Map;

#[derive(Default)]
pub struct FakeIndexClient {
    pub batches: Mutex<Vec<Vec<Map<String, JsonValue>>>>,
    pub fail_next: Mutex<bool>,
}

#[async_trait]
impl IndexClient for FakeIndexClient {
    async fn upsert(
        &self,
        _collection_url: &str,
        documents: Vec<Map<String, JsonValue>>,
    ) -> anyhow::Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let mut fail = self.fail_next.lock().unwrap();
        if *fail {
            *fail = false;
            anyhow::bail!("simulated index failure");
        }
        self.batches.lock().unwrap().push(documents);
        Ok(())
    }
}

impl FakeIndexClient {
    pub fn all_documents(&self) -> Vec<Map<String, JsonValue>> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }
}
