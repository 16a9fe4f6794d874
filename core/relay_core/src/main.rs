mod api;
mod db;
mod gateway;
mod history;
mod quiet;
mod router;
mod settings;
mod sync;
mod wearable;

use anyhow::Context;
use clap::Parser;
use rusqlite::Connection;
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::api::AppState;
use crate::db::{
    get_state, init_db, load_or_init_settings, now_rfc3339, put_state, upsert_app_settings,
    KEY_USER_ID,
};
use crate::gateway::{GatewayEnv, HttpGatewayClient};
use crate::history::HistoryStore;
use crate::quiet::QuietWindow;
use crate::router::IngestRouter;
use crate::settings::{Settings, DEFAULT_HISTORY_CAPACITY};
use crate::sync::GroupSync;
use crate::wearable::{HttpWearableSender, LogSender, WearableSender};

const DEFAULT_PORT: u16 = 17610;

#[derive(Parser, Debug)]
#[command(name = "relay_core", version)]
struct Args {
    /// Listen address.
    ///
    /// Accepts:
    /// - ip:port (recommended), e.g. 127.0.0.1:17610
    /// - ip (implies port 17610), e.g. 127.0.0.1
    /// - localhost or localhost:port
    #[arg(long, default_value = "127.0.0.1:17610")]
    listen: String,

    /// SQLite database path.
    #[arg(long, default_value = "./data/relay-core.db")]
    db: PathBuf,

    /// Number of notifications kept in history on first run (0-100).
    /// Later changes go through POST /settings and are persisted.
    #[arg(long, default_value_t = DEFAULT_HISTORY_CAPACITY)]
    history_capacity: u32,

    /// User identity registered with the notification gateway.
    /// Falls back to the last one used with this database.
    #[arg(long)]
    user_id: Option<String>,

    /// Endpoint that renders notifications on the wearable.
    /// When unset, notifications are only logged and archived.
    #[arg(long)]
    wearable_url: Option<String>,

    /// Notification gateway base URL.
    #[arg(long, default_value = "http://127.0.0.1:17620")]
    gateway_url: String,

    /// Sender id assigned by the notification gateway.
    #[arg(long, default_value = "moneywatch")]
    sender_id: String,

    #[arg(long, value_enum, default_value_t = GatewayEnv::Sandbox)]
    gateway_env: GatewayEnv,

    /// Every group the gateway offers (comma separated).
    #[arg(long, value_delimiter = ',', default_value = "accounts,bills,budgets,alerts")]
    feeds: Vec<String>,

    /// Groups selected on first run (comma separated, subset of --feeds).
    #[arg(long, value_delimiter = ',', default_value = "bills,alerts")]
    default_feeds: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_core=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let feeds = clean_groups(&args.feeds);
    let default_feeds: Vec<String> = clean_groups(&args.default_feeds)
        .into_iter()
        .filter(|g| {
            let known = feeds.contains(g);
            if !known {
                warn!("ignoring default feed '{g}': not in --feeds");
            }
            known
        })
        .collect();

    if let Some(parent) = args.db.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut conn = Connection::open(&args.db)
        .with_context(|| format!("open {}", args.db.display()))?;
    init_db(&conn)?;
    let defaults = Settings {
        history_capacity: args.history_capacity,
        quiet: QuietWindow::default(),
        groups: default_feeds,
    };
    let mut settings = load_or_init_settings(&mut conn, &defaults)?;
    forget_unknown_groups(&mut conn, &mut settings, &feeds)?;
    let user_id = match args.user_id.clone() {
        Some(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => get_state(&conn, KEY_USER_ID)?
            .context("no user id known yet; pass --user-id")?,
    };
    put_state(&conn, KEY_USER_ID, &user_id, &now_rfc3339())?;

    let conn = Arc::new(Mutex::new(conn));
    let settings = Arc::new(Mutex::new(settings));

    let sender: Arc<dyn WearableSender> = match args.wearable_url.as_deref() {
        Some(url) => Arc::new(HttpWearableSender::new(url)?),
        None => Arc::new(LogSender),
    };
    let gateway = Arc::new(HttpGatewayClient::new(
        &args.gateway_url,
        &args.sender_id,
        args.gateway_env,
    )?);

    let history = HistoryStore::new(conn.clone());
    let capacity = { settings.lock().await.history_capacity as usize };
    history.append(None, capacity).await?;

    let state = AppState {
        conn: conn.clone(),
        settings: settings.clone(),
        history: history.clone(),
        router: IngestRouter::new(history, sender, settings.clone()),
        sync: GroupSync::new(conn, gateway, &user_id, &feeds),
    };

    {
        let sync = state.sync.clone();
        let groups = { settings.lock().await.groups.clone() };
        tokio::spawn(async move {
            match sync.sync_if_needed(&groups).await {
                Ok(Some(status)) if status.in_sync() => info!("startup gateway sync succeeded"),
                Ok(Some(_)) => warn!("startup gateway sync incomplete; see GET /sync/status"),
                Ok(None) => {}
                Err(err) => error!("startup gateway sync failed: {err:#}"),
            }
        });
    }

    let app = api::build_router(state);

    let addr = parse_listen(&args.listen)?;
    info!("Relay listening on http://{addr}");
    info!("DB: {}", args.db.display());
    info!("User: {user_id}");
    match args.wearable_url.as_deref() {
        Some(url) => info!("Wearable: {url}"),
        None => info!("Wearable: none (log only)"),
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn clean_groups(raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for g in raw.iter().map(|g| g.trim()).filter(|g| !g.is_empty()) {
        if !out.iter().any(|o| o == g) {
            out.push(g.to_string());
        }
    }
    out
}

/// Groups stored by an earlier run may have been removed from `--feeds`.
fn forget_unknown_groups(
    conn: &mut Connection,
    settings: &mut Settings,
    feeds: &[String],
) -> rusqlite::Result<()> {
    let dropped = settings.retain_known_groups(feeds);
    if dropped.is_empty() {
        return Ok(());
    }
    warn!("dropping selected groups not in --feeds: {}", dropped.join(", "));
    upsert_app_settings(conn, settings, &now_rfc3339())
}

fn parse_listen(input: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    if let Some((host, port_str)) = input.rsplit_once(':') {
        if host == "localhost" {
            let port: u16 = port_str.parse().map_err(|_| {
                anyhow::anyhow!(
                    "invalid --listen '{}': bad port. Example: 127.0.0.1:{}",
                    input,
                    DEFAULT_PORT
                )
            })?;
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), port));
        }
    }

    if input == "localhost" {
        return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), DEFAULT_PORT));
    }

    Err(anyhow::anyhow!(
        "invalid --listen '{}'. Use ip:port (e.g. 127.0.0.1:{}) or ip (e.g. 127.0.0.1).",
        input,
        DEFAULT_PORT
    ))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}
