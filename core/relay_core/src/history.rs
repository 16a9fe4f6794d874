use anyhow::Context;
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::db::{get_state, now_rfc3339, put_state, KEY_HISTORY};

/// Separator of the older archive format, where entries were joined into one string.
const LEGACY_DELIMITER: &str = "<<<>>>";

/// Most-recent-first list of received payloads, bounded by a capacity given on
/// each append. The whole list lives in one `app_state` value and every
/// append rewrites it while holding the connection lock.
#[derive(Clone)]
pub struct HistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl HistoryStore {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Puts `entry` (if any) in front, then drops the oldest entries beyond
    /// `capacity`. `append(None, k)` only re-applies a new capacity.
    pub async fn append(&self, entry: Option<&str>, capacity: usize) -> anyhow::Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let mut entries = get_state(&tx, KEY_HISTORY)?
            .map(|raw| decode_entries(&raw))
            .unwrap_or_default();
        push_bounded(&mut entries, entry, capacity);

        let encoded = serde_json::to_string(&entries).context("encode history")?;
        put_state(&tx, KEY_HISTORY, &encoded, &now_rfc3339())?;
        tx.commit()?;
        Ok(())
    }

    pub async fn list(&self) -> anyhow::Result<Vec<String>> {
        let conn = self.conn.lock().await;
        Ok(get_state(&conn, KEY_HISTORY)?
            .map(|raw| decode_entries(&raw))
            .unwrap_or_default())
    }
}

fn push_bounded(entries: &mut Vec<String>, entry: Option<&str>, capacity: usize) {
    if let Some(e) = entry {
        entries.insert(0, e.to_string());
    }
    entries.truncate(capacity);
}

fn decode_entries(raw: &str) -> Vec<String> {
    if let Ok(entries) = serde_json::from_str::<Vec<String>>(raw) {
        return entries;
    }
    raw.split(LEGACY_DELIMITER)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Display fields pulled out of a wearable notification payload.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EntrySummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

/// Returns `None` when the payload is not JSON or has none of the known fields.
pub fn summarize(payload: &str) -> Option<EntrySummary> {
    let v: Value = serde_json::from_str(payload).ok()?;
    let text_of = |ptr: &str| {
        v.pointer(ptr)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    let summary = EntrySummary {
        title: text_of("/bigTextStyle/bigContentTitle"),
        text: text_of("/bigTextStyle/bigText"),
        link: text_of("/actions/0/extras/0"),
    };
    if summary == EntrySummary::default() {
        return None;
    }
    Some(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_test_db;

    fn store() -> HistoryStore {
        HistoryStore::new(Arc::new(Mutex::new(open_test_db())))
    }

    #[tokio::test]
    async fn empty_store_lists_nothing() {
        let s = store();
        assert!(s.list().await.unwrap().is_empty());
        s.append(None, 5).await.unwrap();
        assert!(s.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn keeps_most_recent_first_within_capacity() {
        let s = store();
        for e in ["A", "B", "C", "D"] {
            s.append(Some(e), 3).await.unwrap();
            assert!(s.list().await.unwrap().len() <= 3);
            assert_eq!(s.list().await.unwrap()[0], e);
        }
        assert_eq!(s.list().await.unwrap(), vec!["D", "C", "B"]);
    }

    #[tokio::test]
    async fn lowering_capacity_trims_oldest_without_reordering() {
        let s = store();
        for e in ["1", "2", "3", "4", "5"] {
            s.append(Some(e), 12).await.unwrap();
        }
        s.append(None, 2).await.unwrap();
        assert_eq!(s.list().await.unwrap(), vec!["5", "4"]);

        // Raising it again does not bring anything back.
        s.append(None, 12).await.unwrap();
        assert_eq!(s.list().await.unwrap(), vec!["5", "4"]);
    }

    #[tokio::test]
    async fn zero_capacity_holds_nothing() {
        let s = store();
        s.append(Some("x"), 0).await.unwrap();
        assert!(s.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_is_stable_between_appends() {
        let s = store();
        s.append(Some("a"), 4).await.unwrap();
        s.append(Some("b"), 4).await.unwrap();
        assert_eq!(s.list().await.unwrap(), s.list().await.unwrap());
    }

    #[tokio::test]
    async fn payloads_may_contain_the_old_delimiter() {
        let s = store();
        let tricky = r#"{"text":"a<<<>>>b"}"#;
        s.append(Some(tricky), 4).await.unwrap();
        s.append(Some("next\nline"), 4).await.unwrap();
        assert_eq!(s.list().await.unwrap(), vec!["next\nline", tricky]);
    }

    #[tokio::test]
    async fn legacy_blob_is_read_and_migrated() {
        let conn = open_test_db();
        put_state(&conn, KEY_HISTORY, "{\"n\":2}<<<>>>{\"n\":1}<<<>>>", "t").unwrap();
        let s = HistoryStore::new(Arc::new(Mutex::new(conn)));

        assert_eq!(s.list().await.unwrap(), vec!["{\"n\":2}", "{\"n\":1}"]);

        s.append(Some("{\"n\":3}"), 2).await.unwrap();
        assert_eq!(s.list().await.unwrap(), vec!["{\"n\":3}", "{\"n\":2}"]);

        let raw = {
            let conn = s.conn.lock().await;
            get_state(&conn, KEY_HISTORY).unwrap().unwrap()
        };
        assert!(raw.starts_with('['), "stored as a JSON array after migration: {raw}");
    }

    #[tokio::test]
    async fn concurrent_appends_are_not_lost() {
        let s = store();
        let mut tasks = Vec::new();
        for i in 0..20 {
            let s = s.clone();
            tasks.push(tokio::spawn(async move {
                s.append(Some(&format!("e{i}")), 100).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(s.list().await.unwrap().len(), 20);
    }

    #[test]
    fn summary_reads_wearable_fields() {
        let payload = r#"{
            "bigTextStyle": {"bigContentTitle": "Low balance", "bigText": "Checking is under $100"},
            "actions": [{"extras": ["https://example.com/accounts"]}]
        }"#;
        assert_eq!(
            summarize(payload),
            Some(EntrySummary {
                title: Some("Low balance".to_string()),
                text: Some("Checking is under $100".to_string()),
                link: Some("https://example.com/accounts".to_string()),
            })
        );
        assert_eq!(summarize("plain text"), None);
        assert_eq!(summarize(r#"{"other": 1}"#), None);
    }
}
