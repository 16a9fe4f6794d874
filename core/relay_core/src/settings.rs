use serde::{Deserialize, Serialize};

use crate::quiet::{QuietWindow, TimeOfDay};

pub const DEFAULT_HISTORY_CAPACITY: u32 = 12;
pub const MAX_HISTORY_CAPACITY: u32 = 100;

/// User-editable configuration, persisted as the single `app_settings` row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub history_capacity: u32,
    pub quiet: QuietWindow,
    /// Gateway groups the user wants to receive.
    pub groups: Vec<String>,
}

impl Settings {
    /// Drops selected groups the gateway no longer offers and returns them.
    pub fn retain_known_groups(&mut self, known_groups: &[String]) -> Vec<String> {
        let (kept, dropped): (Vec<String>, Vec<String>) = std::mem::take(&mut self.groups)
            .into_iter()
            .partition(|g| known_groups.contains(g));
        self.groups = kept;
        dropped
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SettingsUpdate {
    #[serde(default)]
    pub history_capacity: Option<i64>,
    #[serde(default)]
    pub quiet_enabled: Option<bool>,
    #[serde(default)]
    pub quiet_start: Option<String>,
    #[serde(default)]
    pub quiet_end: Option<String>,
    #[serde(default)]
    pub groups: Option<Vec<String>>,
}

/// Validates `req` and returns the merged settings, or a stable error code.
pub fn apply_update(
    current: &Settings,
    req: &SettingsUpdate,
    known_groups: &[String],
) -> Result<Settings, &'static str> {
    let mut next = current.clone();

    if let Some(capacity) = req.history_capacity {
        if !(0..=MAX_HISTORY_CAPACITY as i64).contains(&capacity) {
            return Err("invalid_capacity");
        }
        next.history_capacity = capacity as u32;
    }
    if let Some(enabled) = req.quiet_enabled {
        next.quiet.enabled = enabled;
    }
    if let Some(start) = req.quiet_start.as_deref() {
        next.quiet.start = start.parse::<TimeOfDay>().map_err(|_| "invalid_time")?;
    }
    if let Some(end) = req.quiet_end.as_deref() {
        next.quiet.end = end.parse::<TimeOfDay>().map_err(|_| "invalid_time")?;
    }
    if let Some(groups) = req.groups.as_ref() {
        let mut picked: Vec<String> = Vec::with_capacity(groups.len());
        for g in groups {
            let g = g.trim();
            if !known_groups.iter().any(|k| k == g) {
                return Err("unknown_group");
            }
            if !picked.iter().any(|p| p == g) {
                picked.push(g.to_string());
            }
        }
        next.groups = picked;
    }

    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known() -> Vec<String> {
        ["accounts", "bills", "budgets", "alerts"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn base() -> Settings {
        Settings {
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            quiet: QuietWindow::default(),
            groups: vec!["bills".to_string(), "alerts".to_string()],
        }
    }

    #[test]
    fn empty_update_is_identity() {
        let next = apply_update(&base(), &SettingsUpdate::default(), &known()).unwrap();
        assert_eq!(next, base());
    }

    #[test]
    fn capacity_bounds_are_enforced() {
        for ok in [0, 1, 100] {
            let req = SettingsUpdate {
                history_capacity: Some(ok),
                ..Default::default()
            };
            assert_eq!(
                apply_update(&base(), &req, &known()).unwrap().history_capacity,
                ok as u32
            );
        }
        for bad in [-1, 101, 10_000] {
            let req = SettingsUpdate {
                history_capacity: Some(bad),
                ..Default::default()
            };
            assert_eq!(apply_update(&base(), &req, &known()), Err("invalid_capacity"));
        }
    }

    #[test]
    fn quiet_fields_merge_and_validate() {
        let req = SettingsUpdate {
            quiet_enabled: Some(true),
            quiet_start: Some("22:00".to_string()),
            quiet_end: Some("6:0".to_string()),
            ..Default::default()
        };
        let next = apply_update(&base(), &req, &known()).unwrap();
        assert!(next.quiet.enabled);
        assert_eq!(next.quiet.start.to_string(), "22:00");
        assert_eq!(next.quiet.end.to_string(), "06:00");

        let bad = SettingsUpdate {
            quiet_end: Some("25:00".to_string()),
            ..Default::default()
        };
        assert_eq!(apply_update(&base(), &bad, &known()), Err("invalid_time"));
    }

    #[test]
    fn groups_must_be_known_and_are_deduplicated() {
        let req = SettingsUpdate {
            groups: Some(vec![
                "budgets".to_string(),
                " bills ".to_string(),
                "budgets".to_string(),
            ]),
            ..Default::default()
        };
        let next = apply_update(&base(), &req, &known()).unwrap();
        assert_eq!(next.groups, vec!["budgets".to_string(), "bills".to_string()]);

        let bad = SettingsUpdate {
            groups: Some(vec!["crypto".to_string()]),
            ..Default::default()
        };
        assert_eq!(apply_update(&base(), &bad, &known()), Err("unknown_group"));
    }

    #[test]
    fn retain_known_groups_drops_retired_feeds() {
        let mut s = Settings {
            groups: vec!["bills".to_string(), "crypto".to_string(), "alerts".to_string()],
            ..base()
        };
        assert_eq!(s.retain_known_groups(&known()), vec!["crypto".to_string()]);
        assert_eq!(s.groups, vec!["bills".to_string(), "alerts".to_string()]);
        assert!(s.retain_known_groups(&known()).is_empty());
    }
}
