use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::history::HistoryStore;
use crate::quiet::{QuietWindow, TimeOfDay};
use crate::settings::Settings;
use crate::wearable::WearableSender;

/// Sample payload used by the demo action.
pub const DEMO_PAYLOAD: &str = include_str!("demo_notification.json");

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum Delivery {
    Delivered,
    SkippedQuiet,
    Failed(String),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IngestOutcome {
    pub delivery: Delivery,
    pub archived: bool,
}

/// Handles one inbound push: forward to the wearable unless quiet hours are
/// on, and archive it either way.
#[derive(Clone)]
pub struct IngestRouter {
    history: HistoryStore,
    sender: Arc<dyn WearableSender>,
    settings: Arc<Mutex<Settings>>,
}

impl IngestRouter {
    pub fn new(
        history: HistoryStore,
        sender: Arc<dyn WearableSender>,
        settings: Arc<Mutex<Settings>>,
    ) -> Self {
        Self {
            history,
            sender,
            settings,
        }
    }

    pub async fn ingest(&self, raw: &str) -> IngestOutcome {
        let (quiet, capacity) = {
            let s = self.settings.lock().await;
            (s.quiet, s.history_capacity as usize)
        };
        self.ingest_at(raw, quiet, capacity, TimeOfDay::now_local()).await
    }

    pub async fn ingest_demo(&self) -> IngestOutcome {
        self.ingest(DEMO_PAYLOAD).await
    }

    async fn ingest_at(
        &self,
        raw: &str,
        quiet: QuietWindow,
        capacity: usize,
        now: TimeOfDay,
    ) -> IngestOutcome {
        let payload = raw.trim_end_matches(|c: char| c == '\r' || c == '\n');
        debug!("received notification: {payload}");

        // Delivery runs on its own task so a panicking sender cannot take the
        // archive write down with it.
        let delivery = if quiet.contains(now) {
            info!("inside quiet window ({}), not forwarding", quiet.summary());
            None
        } else {
            let sender = Arc::clone(&self.sender);
            let owned = payload.to_string();
            Some(tokio::spawn(async move { sender.send(&owned).await }))
        };

        let archived = match self.history.append(Some(payload), capacity).await {
            Ok(()) => true,
            Err(err) => {
                error!("archiving notification failed: {err:#}");
                false
            }
        };

        let delivery = match delivery {
            None => Delivery::SkippedQuiet,
            Some(handle) => match handle.await {
                Ok(Ok(())) => Delivery::Delivered,
                Ok(Err(err)) => {
                    error!("wearable delivery failed: {err:#}");
                    Delivery::Failed(format!("{err:#}"))
                }
                Err(err) => {
                    error!("wearable delivery task failed: {err}");
                    Delivery::Failed(format!("delivery task failed: {err}"))
                }
            },
        };

        IngestOutcome { delivery, archived }
    }
}

#[cfg(test)]
pub mod fakes {
    use super::*;
    use async_trait::async_trait;

    #[derive(Default)]
    pub struct FakeSender {
        pub sent: std::sync::Mutex<Vec<String>>,
        pub fail: bool,
        pub panic: bool,
    }

    #[async_trait]
    impl WearableSender for FakeSender {
        async fn send(&self, payload: &str) -> anyhow::Result<()> {
            if self.panic {
                panic!("sender exploded");
            }
            if self.fail {
                anyhow::bail!("wearable unreachable");
            }
            self.sent.lock().unwrap().push(payload.to_string());
            Ok(())
        }
    }
}
