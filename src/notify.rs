//! A dedicated `LISTEN`/`NOTIFY` connection, the production
//! [`NotificationSource`] backing the change-capture loop's CONNECT step
//! (spec.md §4.6). Runs in autocommit, separate from the pooled gateway
//! connections, and forwards `AsyncMessage::Notification` values into an
//! unbounded channel so `poll` can drain them without blocking.

use crate::capture::NotificationSource;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, NoTls};

pub struct PgNotificationSource {
    client: tokio_postgres::Client,
    notifications: mpsc::UnboundedReceiver<Result<String, anyhow::Error>>,
    _connection_task: tokio::task::JoinHandle<()>,
}

impl PgNotificationSource {
    pub async fn connect(connection_string: &str) -> anyhow::Result<Self> {
        let (client, mut connection) = tokio_postgres::connect(connection_string, NoTls).await?;
        // Unbounded channel of `Result`: `Ok` carries a notification payload,
        // `Err` signals the background connection task gave up (closed or
        // errored), so `poll` can tell "nothing new" from "connection died".
        let (tx, rx) = mpsc::unbounded_channel();

        let connection_task = tokio::spawn(async move {
            loop {
                match futures::future::poll_fn(|cx| connection.poll_message(cx)).await {
                    Some(Ok(AsyncMessage::Notification(n))) => {
                        let _ = tx.send(Ok(n.payload().to_string()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "notification connection error");
                        let _ = tx.send(Err(anyhow::anyhow!(e)));
                        break;
                    }
                    None => {
                        let _ = tx.send(Err(anyhow::anyhow!("notification connection closed")));
                        break;
                    }
                }
            }
        });

        Ok(Self {
            client,
            notifications: rx,
            _connection_task: connection_task,
        })
    }
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    async fn subscribe(&mut self, channel: &str) -> anyhow::Result<()> {
        self.client
            .batch_execute(&format!("LISTEN {channel}"))
            .await?;
        Ok(())
    }

    async fn poll(&mut self) -> anyhow::Result<Vec<String>> {
        let mut out = Vec::new();
        loop {
            match self.notifications.try_recv() {
                Ok(Ok(payload)) => out.push(payload),
                Ok(Err(e)) => return Err(e),
                Err(_) => break,
            }
        }
        Ok(out)
    }
}
