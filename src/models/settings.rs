use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

pub const DEFAULT_LANG: &str = "English";
const MIN_REFRESH_FLOOR: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InventoryFilters {
    pub game_name_search: Vec<String>,
    pub show_active: bool,
    pub show_benefit_badge: bool,
    pub show_benefit_emote: bool,
    pub show_benefit_item: bool,
    pub show_benefit_other: bool,
    pub show_expired: bool,
    pub show_finished: bool,
    pub show_not_linked: bool,
    pub show_upcoming: bool,
}

impl Default for InventoryFilters {
    fn default() -> Self {
        Self {
            game_name_search: vec![],
            show_active: false,
            show_benefit_badge: true,
            show_benefit_emote: true,
            show_benefit_item: true,
            show_benefit_other: true,
            show_expired: false,
            show_finished: false,
            show_not_linked: true,
            show_upcoming: true,
        }
    }
}

/// Benefit-type gate for wanted drops.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "UPPERCASE")]
pub struct MiningBenefits {
    pub item: bool,
    pub badge: bool,
    pub emote: bool,
    pub other: bool,
}

impl Default for MiningBenefits {
    fn default() -> Self {
        Self { item: true, badge: true, emote: true, other: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Priority list; empty means every campaign's game is allowed.
    pub games_to_watch: Vec<String>,
    pub language: String,
    pub dark_mode: bool,
    /// Heartbeat divisor, 1..=6.
    pub connection_quality: u32,
    /// Inventory re-fetch floor in minutes, at least 5.
    pub minimum_refresh_interval_minutes: u32,
    /// HTTP/SOCKS proxy URL; empty disables the proxy.
    pub proxy: String,
    pub inventory_filters: InventoryFilters,
    pub mining_benefits: MiningBenefits,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            games_to_watch: vec![],
            language: DEFAULT_LANG.to_string(),
            dark_mode: false,
            connection_quality: 1,
            minimum_refresh_interval_minutes: 30,
            proxy: String::new(),
            inventory_filters: InventoryFilters::default(),
            mining_benefits: MiningBenefits::default(),
        }
    }
}

impl Settings {
    /// Load settings from disk, merging over defaults.
    ///
    /// Unknown keys are dropped and values of the wrong type fall back to
    /// the default, so a stale or hand-edited file never aborts startup.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        let loaded: Value =
            serde_json::from_str(&raw).with_context(|| "settings file is not valid JSON")?;
        let mut template = serde_json::to_value(Self::default())?;
        merge_template(&mut template, &loaded);
        let mut settings: Settings = serde_json::from_value(template)?;
        settings.clamp();
        Ok(settings)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("writing settings to {}", path.display()))?;
        Ok(())
    }

    /// Apply a partial update from the control surface.
    pub fn apply_patch(&mut self, patch: &Value) -> Result<()> {
        let mut current = serde_json::to_value(&*self)?;
        merge_template(&mut current, patch);
        *self = serde_json::from_value(current)?;
        self.clamp();
        Ok(())
    }

    fn clamp(&mut self) {
        self.connection_quality = self.connection_quality.clamp(1, 6);
        self.minimum_refresh_interval_minutes =
            self.minimum_refresh_interval_minutes.max(MIN_REFRESH_FLOOR);
    }

    /// Heartbeat interval derived from connection quality.
    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(20.0 / self.connection_quality.clamp(1, 6) as f64)
    }
}

/// Overlay `incoming` onto `template` in place.
///
/// Keys absent from the template are discarded; type mismatches keep the
/// template value; nested objects merge recursively.
fn merge_template(template: &mut Value, incoming: &Value) {
    let (Value::Object(template_map), Value::Object(incoming_map)) = (template, incoming) else {
        return;
    };
    for (key, incoming_value) in incoming_map {
        match template_map.get_mut(key) {
            Some(slot) if same_kind(slot, incoming_value) => {
                if slot.is_object() {
                    merge_template(slot, incoming_value);
                } else {
                    *slot = incoming_value.clone();
                }
            }
            _ => {} // unknown key or wrong type: keep the template
        }
    }
}

fn same_kind(a: &Value, b: &Value) -> bool {
    matches!(
        (a, b),
        (Value::Null, Value::Null)
            | (Value::Bool(_), Value::Bool(_))
            | (Value::Number(_), Value::Number(_))
            | (Value::String(_), Value::String(_))
            | (Value::Array(_), Value::Array(_))
            | (Value::Object(_), Value::Object(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.connection_quality, 1);
        assert_eq!(settings.minimum_refresh_interval_minutes, 30);
        assert!(settings.games_to_watch.is_empty());
        assert!(settings.mining_benefits.item);
    }

    #[test]
    fn test_merge_drops_unknown_keys_and_bad_types() {
        let mut template = serde_json::to_value(Settings::default()).unwrap();
        let incoming = json!({
            "games_to_watch": ["GameA", "GameB"],
            "connection_quality": "fast",      // wrong type, kept as default
            "no_such_key": 42,                 // unknown, dropped
            "dark_mode": true,
        });
        merge_template(&mut template, &incoming);
        let settings: Settings = serde_json::from_value(template).unwrap();
        assert_eq!(settings.games_to_watch, vec!["GameA", "GameB"]);
        assert_eq!(settings.connection_quality, 1);
        assert!(settings.dark_mode);
    }

    #[test]
    fn test_apply_patch_clamps_ranges() {
        let mut settings = Settings::default();
        settings
            .apply_patch(&json!({"connection_quality": 99, "minimum_refresh_interval_minutes": 1}))
            .unwrap();
        assert_eq!(settings.connection_quality, 6);
        assert_eq!(settings.minimum_refresh_interval_minutes, 5);
    }

    #[test]
    fn test_heartbeat_interval_divisor() {
        let mut settings = Settings::default();
        assert_eq!(settings.heartbeat_interval().as_secs(), 20);
        settings.connection_quality = 4;
        assert_eq!(settings.heartbeat_interval(), std::time::Duration::from_secs_f64(5.0));
    }

    #[test]
    fn test_mining_benefits_uppercase_keys() {
        let json = serde_json::to_value(MiningBenefits::default()).unwrap();
        assert!(json.get("ITEM").is_some());
        assert!(json.get("BADGE").is_some());
        assert!(json.get("EMOTE").is_some());
        assert!(json.get("OTHER").is_some());
    }

    #[test]
    fn test_save_and_reload_roundtrip() {
        let dir = std::env::temp_dir().join(format!("dm-settings-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        let mut settings = Settings::default();
        settings.games_to_watch = vec!["GameA".into()];
        settings.proxy = "socks5://127.0.0.1:9050".into();
        settings.save(&path).unwrap();
        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded, settings);
        std::fs::remove_dir_all(&dir).ok();
    }
}
