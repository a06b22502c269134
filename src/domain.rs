//! Mode Entry / Domain Binder (C8)
//!
//! Resolves the domain, binds its configuration set, and wires the core
//! components together for either mode (spec.md §4.8). `full` runs before
//! `listener` when both flags are passed.

use crate::buffer_protocol::PgEventBufferProtocol;
use crate::capture::{CaptureConfig, CaptureLoop};
use crate::config::{Config, DomainConfig};
use crate::gateway::{ConnectionParams, PgStoreGateway, StoreGateway};
use crate::hooks::HookRegistry;
use crate::index::{IndexClient, SolrIndexClient};
use crate::reindex::{ReindexConfig, ReindexPlanner};
use std::sync::Arc;
use std::time::Duration;

pub struct Runtime {
    pub gateway: Arc<dyn StoreGateway>,
    pub index: Arc<dyn IndexClient>,
    pub hooks: Arc<HookRegistry>,
    pub domain_config: DomainConfig,
    pub config: Config,
}

impl Runtime {
    pub async fn connect(config: Config, domain: &str) -> anyhow::Result<Self> {
        let domain_config = config.bind_domain(domain)?;

        let params = ConnectionParams {
            name: config.global.database_name.clone(),
            user: config.secrets.database_user.clone(),
            password: config.secrets.database_password.clone(),
            host: config.global.database_host.clone(),
            port: config.global.database_port,
            schema: config.global.database_schema.clone(),
        };
        let gateway: Arc<dyn StoreGateway> = Arc::new(PgStoreGateway::connect(&params).await?);
        let index: Arc<dyn IndexClient> = Arc::new(SolrIndexClient::new(
            config.secrets.solr_user.clone(),
            config.secrets.solr_password.clone(),
        )?);
        let hooks = Arc::new(HookRegistry::new());

        Ok(Self {
            gateway,
            index,
            hooks,
            domain_config,
            config,
        })
    }

    fn collection_url(&self) -> String {
        format!(
            "{}/{}",
            self.config.global.solr_url.trim_end_matches('/'),
            self.domain_config.collection_name
        )
    }

    /// `full` mode: run the override planner; if it reports no pending
    /// override, fall through to a single unwindowed refresh (spec.md
    /// §4.7 step 1, §4.8).
    pub async fn run_full(&self) -> anyhow::Result<()> {
        let reindex = ReindexPlanner::new(
            ReindexConfig {
                domain: self.domain_config.domain.clone(),
                get_all_procedure: self.domain_config.get_all_procedure.clone(),
                collection_url: self.collection_url(),
                get_override_procedure: self.config.global.db_func_get_index_override.clone(),
                clean_override_procedure: self.config.global.db_func_clean_index_override.clone(),
                source_ts_field: self.config.global.db_field_index_override_source_ts.clone(),
                target_ts_field: self.config.global.db_field_index_override_target_ts.clone(),
                step_days: self.config.global.idx_override_timestep_day_size,
                concurrency: self.config.global.idx_override_concurrent_thread_count,
            },
            self.gateway.clone(),
            self.index.clone(),
            self.hooks.clone(),
        );

        if !reindex.run().await? {
            tracing::info!(domain = %self.domain_config.domain, "no override pending, running unwindowed full refresh");
            reindex.run_unwindowed_full().await?;
        }
        Ok(())
    }

    /// `listener` mode: run the change-capture loop against a real
    /// `tokio_postgres` notification source. This normally does not
    /// return.
    pub async fn run_listener<F, Fut, S>(&self, connect_notifications: F) -> anyhow::Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<S>>,
        S: crate::capture::NotificationSource,
    {
        let buffer_protocol = Arc::new(PgEventBufferProtocol::new(
            self.gateway.clone(),
            self.config
                .global
                .db_func_get_event_notification_buffer
                .clone(),
            self.config
                .global
                .db_func_clean_event_notification_buffer
                .clone(),
            self.config.global.idx_event_fetch_key.clone(),
        ));

        let capture = CaptureLoop::new(
            CaptureConfig {
                domain: self.domain_config.domain.clone(),
                channel_name: self.domain_config.channel_name.clone(),
                get_by_id_procedure: self.domain_config.get_by_id_procedure.clone(),
                fetch_key: self.domain_config.fetch_key.clone(),
                collection_url: self.collection_url(),
                buffer_size: self.domain_config.buffer_size,
                buffer_duration: Duration::from_secs(self.domain_config.buffer_duration_seconds),
                retry_delay: Duration::from_secs(self.config.global.idx_buffer_retry_seconds),
            },
            self.gateway.clone(),
            buffer_protocol,
            self.index.clone(),
            self.hooks.clone(),
        );

        capture.run(connect_notifications).await
    }
}
