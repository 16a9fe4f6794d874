use anyhow::Context;
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "relay_ctl", version)]
struct Args {
    /// Relay base URL, e.g. http://127.0.0.1:17610
    #[arg(long, default_value = "http://127.0.0.1:17610")]
    core_url: String,

    /// Print raw JSON instead of a short summary.
    #[arg(long, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deliver a push payload to the relay, as the push service would.
    Push {
        /// Payload text. Reads --file when omitted.
        #[arg(long)]
        payload: Option<String>,

        #[arg(long, conflicts_with = "payload")]
        file: Option<PathBuf>,
    },
    /// Send the built-in demo notification.
    Demo,
    /// Show archived notifications, newest first.
    History {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Show or change relay settings.
    Settings {
        #[command(subcommand)]
        action: Option<SettingsAction>,
    },
    /// Re-send group membership to the notification gateway.
    Sync,
    /// Show the outcome of the last gateway sync.
    Status,
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    Show,
    Set {
        /// History capacity (0-100).
        #[arg(long)]
        capacity: Option<i64>,

        #[arg(long, action = clap::ArgAction::Set)]
        quiet: Option<bool>,

        /// Quiet window start, H:MM.
        #[arg(long)]
        quiet_start: Option<String>,

        /// Quiet window end, H:MM.
        #[arg(long)]
        quiet_end: Option<String>,

        /// Selected gateway groups (comma separated). Pass "" to select none.
        #[arg(long, value_delimiter = ',')]
        groups: Option<Vec<String>>,
    },
}

#[derive(Serialize, Default)]
struct SettingsUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    history_capacity: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quiet_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quiet_start: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quiet_end: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    groups: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct OkResponse<T> {
    ok: bool,
    data: Option<T>,
    error: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_ctl=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let client = Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .context("build http client")?;
    let base = args.core_url.trim_end_matches('/').to_string();

    if let Err(e) = run(&client, &base, args.json, args.command).await {
        error!("{e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(client: &Client, base: &str, raw: bool, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Push { payload, file } => {
            let payload = match (payload, file) {
                (Some(p), _) => p,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("read {}", path.display()))?,
                (None, None) => anyhow::bail!("pass --payload or --file"),
            };
            let out: Value = send_ok(
                client.post(format!("{base}/push")).json(&serde_json::json!({ "payload": payload })),
            )
            .await?;
            print_outcome(&out, raw);
        }
        Command::Demo => {
            let out: Value = send_ok(client.post(format!("{base}/demo"))).await?;
            print_outcome(&out, raw);
        }
        Command::History { limit } => {
            let mut req = client.get(format!("{base}/history"));
            if let Some(limit) = limit {
                req = req.query(&[("limit", limit)]);
            }
            let items: Vec<Value> = send_ok(req).await?;
            if raw {
                println!("{}", serde_json::to_string_pretty(&items)?);
            } else if items.is_empty() {
                println!("(no notifications)");
            } else {
                for (i, item) in items.iter().enumerate() {
                    println!("{:>3}. {}", i + 1, history_line(item));
                }
            }
        }
        Command::Settings { action } => {
            let settings: Value = match action.unwrap_or(SettingsAction::Show) {
                SettingsAction::Show => send_ok(client.get(format!("{base}/settings"))).await?,
                SettingsAction::Set {
                    capacity,
                    quiet,
                    quiet_start,
                    quiet_end,
                    groups,
                } => {
                    let update = SettingsUpdate {
                        history_capacity: capacity,
                        quiet_enabled: quiet,
                        quiet_start,
                        quiet_end,
                        groups: groups.map(selected_groups),
                    };
                    send_ok(client.post(format!("{base}/settings")).json(&update)).await?
                }
            };
            if raw {
                println!("{}", serde_json::to_string_pretty(&settings)?);
            } else {
                print_settings(&settings);
            }
        }
        Command::Sync => {
            info!("requesting gateway sync");
            let status: Value = send_ok(client.post(format!("{base}/sync"))).await?;
            print_sync(&status, raw);
        }
        Command::Status => {
            let status: Value = send_ok(client.get(format!("{base}/sync/status"))).await?;
            print_sync(&status, raw);
        }
    }
    Ok(())
}

async fn send_ok<T: DeserializeOwned>(req: reqwest::RequestBuilder) -> anyhow::Result<T> {
    let res = req.send().await?;
    let status = res.status().as_u16();
    let bytes = res.bytes().await?;
    decode_envelope(status, &bytes)
}

fn decode_envelope<T: DeserializeOwned>(status: u16, bytes: &[u8]) -> anyhow::Result<T> {
    let body: OkResponse<T> = serde_json::from_slice(bytes)
        .with_context(|| format!("http_{status}: unexpected body"))?;
    if !body.ok {
        anyhow::bail!(
            "http_{status}: {}",
            body.error.as_deref().unwrap_or("not_ok")
        );
    }
    body.data.ok_or_else(|| anyhow::anyhow!("missing_data"))
}

/// `--groups ""` arrives as one empty value and means "no groups".
fn selected_groups(raw: Vec<String>) -> Vec<String> {
    raw.into_iter()
        .map(|g| g.trim().to_string())
        .filter(|g| !g.is_empty())
        .collect()
}

fn str_at<'a>(v: &'a Value, ptr: &str) -> Option<&'a str> {
    v.pointer(ptr).and_then(Value::as_str)
}

fn history_line(item: &Value) -> String {
    let title = str_at(item, "/summary/title");
    let text = str_at(item, "/summary/text");
    match (title, text) {
        (Some(t), Some(x)) => format!("{t}: {x}"),
        (Some(t), None) => t.to_string(),
        (None, Some(x)) => x.to_string(),
        (None, None) => {
            let payload = str_at(item, "/payload").unwrap_or("");
            let mut short: String = payload.chars().take(80).collect();
            if payload.chars().count() > 80 {
                short.push('…');
            }
            short
        }
    }
}

fn print_outcome(out: &Value, raw: bool) {
    if raw {
        println!("{out}");
        return;
    }
    let delivery = match str_at(out, "/delivery/status") {
        Some("delivered") => "delivered to wearable".to_string(),
        Some("skipped_quiet") => "not forwarded (quiet hours)".to_string(),
        Some("failed") => format!(
            "delivery failed: {}",
            str_at(out, "/delivery/reason").unwrap_or("?")
        ),
        _ => "unknown delivery".to_string(),
    };
    let archived = out.get("archived").and_then(Value::as_bool).unwrap_or(false);
    println!(
        "{delivery}; {}",
        if archived { "archived" } else { "NOT archived" }
    );
}

fn print_settings(s: &Value) {
    let capacity = s.get("history_capacity").and_then(Value::as_u64).unwrap_or(0);
    println!("history:  retaining up to {capacity} entries");
    println!(
        "quiet:    {}{}",
        str_at(s, "/quiet_summary").unwrap_or("?"),
        if s.get("quiet_now").and_then(Value::as_bool) == Some(true) {
            " (active now)"
        } else {
            ""
        }
    );
    let list = |key: &str| -> String {
        s.get(key)
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_default()
    };
    println!("groups:   {}", list("groups"));
    println!("known:    {}", list("known_groups"));
    if let Some(sync) = s.get("sync") {
        print_sync(sync, false);
    }
}

fn print_sync(status: &Value, raw: bool) {
    if raw {
        println!("{status}");
        return;
    }
    let describe = |key: &str| match status.get(key) {
        None | Some(Value::Null) => "-".to_string(),
        Some(o) => {
            let ok = o.get("ok").and_then(Value::as_bool).unwrap_or(false);
            let detail = str_at(o, "/detail").unwrap_or("");
            format!("{} {detail}", if ok { "ok" } else { "FAILED" })
        }
    };
    if let Some(user) = str_at(status, "/user_id") {
        println!("user:        {user}");
    }
    if let Some(in_sync) = status.get("in_sync").and_then(Value::as_bool) {
        println!("in sync:     {}", if in_sync { "yes" } else { "no" });
    }
    println!("subscribe:   {}", describe("subscribe"));
    println!("unsubscribe: {}", describe("unsubscribe"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn history_line_prefers_summary() {
        let item = json!({"payload": "{}", "summary": {"title": "Bill due", "text": "Rent tomorrow"}});
        assert_eq!(history_line(&item), "Bill due: Rent tomorrow");

        let item = json!({"payload": "plain text"});
        assert_eq!(history_line(&item), "plain text");

        let long = "x".repeat(100);
        let item = json!({ "payload": long });
        let line = history_line(&item);
        assert_eq!(line.chars().count(), 81);
        assert!(line.ends_with('…'));
    }

    #[test]
    fn settings_update_only_sends_given_fields() {
        let update = SettingsUpdate {
            history_capacity: Some(5),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            json!({"history_capacity": 5})
        );
    }

    #[test]
    fn cli_parses_settings_set() {
        let args = Args::try_parse_from([
            "relay_ctl",
            "settings",
            "set",
            "--capacity",
            "20",
            "--quiet",
            "true",
            "--quiet-start",
            "22:00",
            "--groups",
            "bills,alerts",
        ])
        .unwrap();
        match args.command {
            Command::Settings {
                action:
                    Some(SettingsAction::Set {
                        capacity,
                        quiet,
                        quiet_start,
                        groups,
                        ..
                    }),
            } => {
                assert_eq!(capacity, Some(20));
                assert_eq!(quiet, Some(true));
                assert_eq!(quiet_start.as_deref(), Some("22:00"));
                assert_eq!(groups, Some(vec!["bills".to_string(), "alerts".to_string()]));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn envelope_yields_data_or_error() {
        let items: Vec<Value> =
            decode_envelope(200, br#"{"ok":true,"data":[{"payload":"a"}]}"#).unwrap();
        assert_eq!(items, vec![json!({"payload": "a"})]);

        let err = decode_envelope::<Vec<Value>>(400, br#"{"ok":false,"error":"x"}"#).unwrap_err();
        assert_eq!(err.to_string(), "http_400: x");

        let err = decode_envelope::<Value>(200, br#"{"ok":true}"#).unwrap_err();
        assert_eq!(err.to_string(), "missing_data");

        let err = decode_envelope::<Value>(422, b"Failed to deserialize").unwrap_err();
        assert_eq!(err.to_string(), "http_422: unexpected body");
    }

    #[test]
    fn empty_groups_flag_selects_none() {
        let args = Args::try_parse_from(["relay_ctl", "settings", "set", "--groups", ""]).unwrap();
        let Command::Settings {
            action: Some(SettingsAction::Set { groups, .. }),
        } = args.command
        else {
            panic!("unexpected command");
        };
        let update = SettingsUpdate {
            groups: groups.map(selected_groups),
            ..Default::default()
        };
        assert_eq!(serde_json::to_value(&update).unwrap(), json!({"groups": []}));

        assert_eq!(
            selected_groups(vec![" bills".to_string(), String::new()]),
            vec!["bills".to_string()]
        );
    }
}
