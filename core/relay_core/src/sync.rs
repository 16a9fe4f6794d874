use anyhow::Context;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::{sync::Mutex, task::JoinSet};
use tracing::{error, info};

use crate::db::{get_state, now_rfc3339, put_state, KEY_REGISTRATION_ID, KEY_SYNC_STATUS};
use crate::gateway::GatewayClient;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub finished_at: String,
}

impl OpOutcome {
    fn new(ok: bool, detail: String) -> Self {
        Self {
            ok,
            detail: Some(detail),
            finished_at: now_rfc3339(),
        }
    }
}

/// Result of the last group sync. Subscribing and unsubscribing are
/// recorded separately; `unsubscribe` is `None` when there was nothing to leave.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    #[serde(default)]
    pub subscribe: Option<OpOutcome>,
    #[serde(default)]
    pub unsubscribe: Option<OpOutcome>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl SyncStatus {
    pub fn in_sync(&self) -> bool {
        matches!(&self.subscribe, Some(o) if o.ok) && self.unsubscribe.as_ref().map_or(true, |o| o.ok)
    }
}

/// Keeps the gateway's view of the user's groups in line with the selected ones.
#[derive(Clone)]
pub struct GroupSync {
    conn: Arc<Mutex<Connection>>,
    gateway: Arc<dyn GatewayClient>,
    user_id: Arc<str>,
    known_groups: Arc<[String]>,
    // Serializes whole sync runs so their status writes cannot interleave.
    running: Arc<Mutex<()>>,
}

impl GroupSync {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        gateway: Arc<dyn GatewayClient>,
        user_id: &str,
        known_groups: &[String],
    ) -> Self {
        Self {
            conn,
            gateway,
            user_id: Arc::from(user_id),
            known_groups: Arc::from(known_groups),
            running: Arc::new(Mutex::new(())),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn known_groups(&self) -> &[String] {
        &self.known_groups
    }

    pub async fn status(&self) -> anyhow::Result<SyncStatus> {
        let conn = self.conn.lock().await;
        let Some(raw) = get_state(&conn, KEY_SYNC_STATUS)? else {
            return Ok(SyncStatus::default());
        };
        // An unreadable status only means we have to sync again.
        Ok(serde_json::from_str(&raw).unwrap_or_default())
    }

    pub async fn registration_id(&self) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().await;
        Ok(get_state(&conn, KEY_REGISTRATION_ID)?)
    }

    /// Stores the push registration id and registers the user for `selected`.
    pub async fn register(&self, registration_id: &str, selected: &[String]) -> anyhow::Result<SyncStatus> {
        {
            let conn = self.conn.lock().await;
            put_state(&conn, KEY_REGISTRATION_ID, registration_id, &now_rfc3339())?;
        }
        info!("push registration received; registering {} with gateway", self.user_id);
        self.sync_groups(selected).await
    }

    pub async fn sync_if_needed(&self, selected: &[String]) -> anyhow::Result<Option<SyncStatus>> {
        if self.status().await?.in_sync() {
            return Ok(None);
        }
        info!("gateway groups not in sync; starting sync");
        self.sync_groups(selected).await.map(Some)
    }

    /// Leaves every known group that is not selected and registers for the
    /// selected ones. Both sides run concurrently and are awaited together.
    pub async fn sync_groups(&self, selected: &[String]) -> anyhow::Result<SyncStatus> {
        let _running = self.running.lock().await;
        let registration_id = self.registration_id().await?.unwrap_or_default();
        let stale = unselected_groups(&self.known_groups, selected);

        let (unsubscribe, subscribe) = tokio::join!(
            self.leave_groups(stale),
            self.join_groups(selected, &registration_id)
        );

        let status = SyncStatus {
            subscribe: Some(subscribe),
            unsubscribe,
            updated_at: Some(now_rfc3339()),
        };
        let encoded = serde_json::to_string(&status).context("encode sync status")?;
        {
            let conn = self.conn.lock().await;
            put_state(&conn, KEY_SYNC_STATUS, &encoded, &now_rfc3339())?;
        }
        if !status.in_sync() {
            info!("gateway sync finished with errors");
        }
        Ok(status)
    }

    async fn join_groups(&self, selected: &[String], registration_id: &str) -> OpOutcome {
        match self
            .gateway
            .register_user(&self.user_id, selected, registration_id)
            .await
        {
            Ok(()) => {
                info!("registered user for {} group(s)", selected.len());
                OpOutcome::new(true, format!("registered for {} group(s)", selected.len()))
            }
            Err(err) => {
                error!("register_user failed: {err:#}");
                OpOutcome::new(false, format!("register_user: {err:#}"))
            }
        }
    }

    async fn leave_groups(&self, groups: Vec<String>) -> Option<OpOutcome> {
        if groups.is_empty() {
            return None;
        }
        let total = groups.len();
        let mut set = JoinSet::new();
        for group in groups {
            let gateway = Arc::clone(&self.gateway);
            let user_id = Arc::clone(&self.user_id);
            set.spawn(async move {
                let res = gateway.remove_user_from_group(&user_id, &group).await;
                (group, res)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((group, Ok(()))) => info!("removed user from group {group}"),
                Ok((group, Err(err))) => {
                    error!("remove_user_from_group {group} failed: {err:#}");
                    failures.push(format!("{group}: {err:#}"));
                }
                Err(err) => {
                    error!("remove_user_from_group task failed: {err}");
                    failures.push(format!("task: {err}"));
                }
            }
        }

        Some(if failures.is_empty() {
            OpOutcome::new(true, format!("removed from {total} group(s)"))
        } else {
            failures.sort();
            OpOutcome::new(false, failures.join("; "))
        })
    }
}

fn unselected_groups(known: &[String], selected: &[String]) -> Vec<String> {
    known
        .iter()
        .filter(|g| !selected.contains(g))
        .cloned()
        .collect()
}
