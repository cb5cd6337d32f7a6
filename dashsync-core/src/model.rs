//! Dashboard aggregate and its parts.
//!
//! ```text
//! Dashboard (one per user, versioned)
//!   ├── tabs: [Tab]
//!   │     ├── widgets: [Widget]   (type + opaque JSON data)
//!   │     └── layouts             (opaque grid positions)
//!   └── settings                  (background, grid, opacity)
//! ```
//!
//! Field names serialize as camelCase so stored documents and wire bodies
//! share one shape.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

use crate::error::SyncError;

/// Default tab name for freshly created dashboards.
pub const DEFAULT_TAB_NAME: &str = "My Dashboard";

/// Default background for freshly created dashboards.
pub const DEFAULT_BACKGROUND_VALUE: &str = "linear-gradient(135deg, #667eea 0%, #764ba2 100%)";
pub const DEFAULT_BACKGROUND_LABEL: &str = "Purple Dream";

pub const DEFAULT_GRID_COLS: u8 = 10;
pub const MIN_GRID_COLS: u8 = 6;
pub const MAX_GRID_COLS: u8 = 10;
pub const DEFAULT_WIDGET_OPACITY: u8 = 100;

/// Closed set of widget kinds. Payloads are never inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WidgetType {
    Bookmark,
    BookmarkList,
    Todo,
    Note,
    Clock,
    Weather,
    Rss,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Widget {
    pub id: String,
    #[serde(rename = "type")]
    pub widget_type: WidgetType,
    pub title: String,
    /// Type-dependent payload, opaque to the sync engine.
    #[serde(default = "empty_object")]
    pub data: serde_json::Value,
}

impl Widget {
    pub fn new(id: impl Into<String>, widget_type: WidgetType, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            widget_type,
            title: title.into(),
            data: empty_object(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tab {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub widgets: Vec<Widget>,
    /// Grid positions keyed by breakpoint, then widget id.
    #[serde(default = "default_layouts")]
    pub layouts: serde_json::Value,
}

impl Tab {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            widgets: Vec::new(),
            layouts: default_layouts(),
        }
    }

    pub fn with_widget(mut self, widget: Widget) -> Self {
        self.widgets.push(widget);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundKind {
    Gradient,
    Color,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Background {
    #[serde(rename = "type")]
    pub kind: BackgroundKind,
    pub value: String,
    #[serde(default)]
    pub label: String,
}

impl Default for Background {
    fn default() -> Self {
        Self {
            kind: BackgroundKind::Gradient,
            value: DEFAULT_BACKGROUND_VALUE.to_string(),
            label: DEFAULT_BACKGROUND_LABEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub background: Background,
    #[serde(default = "default_grid_cols")]
    pub grid_cols: u8,
    #[serde(default = "default_widget_opacity")]
    pub widget_opacity: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            background: Background::default(),
            grid_cols: DEFAULT_GRID_COLS,
            widget_opacity: DEFAULT_WIDGET_OPACITY,
        }
    }
}

/// The replaceable content of a dashboard: what updates write, what backups
/// hold and what conflict reports carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardData {
    pub tabs: Vec<Tab>,
    pub settings: Settings,
}

impl DashboardData {
    pub fn new(tabs: Vec<Tab>, settings: Settings) -> Self {
        Self { tabs, settings }
    }

    /// Content of a freshly created dashboard: one empty tab, default settings.
    pub fn initial(now_ms: u64) -> Self {
        Self {
            tabs: vec![Tab::new(format!("tab-{now_ms}"), DEFAULT_TAB_NAME)],
            settings: Settings::default(),
        }
    }

    /// Check structural rules the store relies on.
    ///
    /// Widget payloads and layouts are not looked at.
    pub fn validate(&self) -> Result<(), SyncError> {
        let mut tab_ids = HashSet::with_capacity(self.tabs.len());
        for tab in &self.tabs {
            if tab.id.is_empty() {
                return Err(SyncError::Validation("tab id must not be empty".into()));
            }
            if tab.name.trim().is_empty() {
                return Err(SyncError::Validation(format!("tab {} has an empty name", tab.id)));
            }
            if !tab_ids.insert(tab.id.as_str()) {
                return Err(SyncError::Validation(format!("duplicate tab id {}", tab.id)));
            }

            let mut widget_ids = HashSet::with_capacity(tab.widgets.len());
            for widget in &tab.widgets {
                if widget.id.is_empty() {
                    return Err(SyncError::Validation(format!(
                        "widget without id in tab {}",
                        tab.id
                    )));
                }
                if !widget_ids.insert(widget.id.as_str()) {
                    return Err(SyncError::Validation(format!(
                        "duplicate widget id {} in tab {}",
                        widget.id, tab.id
                    )));
                }
            }
        }

        let cols = self.settings.grid_cols;
        if !(MIN_GRID_COLS..=MAX_GRID_COLS).contains(&cols) {
            return Err(SyncError::Validation(format!(
                "gridCols must be between {MIN_GRID_COLS} and {MAX_GRID_COLS}, got {cols}"
            )));
        }
        if self.settings.widget_opacity > 100 {
            return Err(SyncError::Validation(format!(
                "widgetOpacity must be at most 100, got {}",
                self.settings.widget_opacity
            )));
        }

        Ok(())
    }
}

/// The per-user dashboard aggregate.
///
/// `version` is the only concurrency token: it starts at 1 and moves by
/// exactly one per accepted mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dashboard {
    pub id: Uuid,
    pub user_id: String,
    pub tabs: Vec<Tab>,
    pub settings: Settings,
    pub version: u64,
    pub last_backup_at: Option<u64>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Dashboard {
    /// Default single-tab dashboard at version 1.
    pub fn new_default(user_id: impl Into<String>, now_ms: u64) -> Self {
        Self::with_data(user_id, DashboardData::initial(now_ms), now_ms)
    }

    /// New dashboard at version 1 holding `data`.
    pub fn with_data(user_id: impl Into<String>, data: DashboardData, now_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            tabs: data.tabs,
            settings: data.settings,
            version: 1,
            last_backup_at: None,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    /// Copy of the replaceable content.
    pub fn data(&self) -> DashboardData {
        DashboardData {
            tabs: self.tabs.clone(),
            settings: self.settings.clone(),
        }
    }

    /// Replace content and advance the version by one.
    ///
    /// Returns the new version.
    pub fn apply(&mut self, data: DashboardData, now_ms: u64) -> u64 {
        self.tabs = data.tabs;
        self.settings = data.settings;
        self.version += 1;
        self.updated_at = now_ms;
        self.version
    }
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

fn default_layouts() -> serde_json::Value {
    serde_json::json!({ "lg": [] })
}

fn default_grid_cols() -> u8 {
    DEFAULT_GRID_COLS
}

fn default_widget_opacity() -> u8 {
    DEFAULT_WIDGET_OPACITY
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data() -> DashboardData {
        DashboardData::new(
            vec![Tab::new("t1", "Home")
                .with_widget(Widget::new("w1", WidgetType::Note, "Notes"))
                .with_widget(
                    Widget::new("w2", WidgetType::BookmarkList, "Links")
                        .with_data(serde_json::json!({ "items": [1, 2, 3] })),
                )],
            Settings::default(),
        )
    }

    #[test]
    fn test_default_dashboard() {
        let dash = Dashboard::new_default("user-1", 1_700_000_000_000);
        assert_eq!(dash.version, 1);
        assert_eq!(dash.user_id, "user-1");
        assert!(dash.last_backup_at.is_none());
        assert_eq!(dash.tabs.len(), 1);
        assert_eq!(dash.tabs[0].name, DEFAULT_TAB_NAME);
        assert_eq!(dash.tabs[0].id, "tab-1700000000000");
        assert!(dash.tabs[0].widgets.is_empty());
        assert_eq!(dash.settings.grid_cols, 10);
        assert_eq!(dash.settings.widget_opacity, 100);
        assert_eq!(dash.settings.background.kind, BackgroundKind::Gradient);
        assert_eq!(dash.settings.background.label, "Purple Dream");
    }

    #[test]
    fn test_apply_increments_version() {
        let mut dash = Dashboard::new_default("user-1", 10);
        let v = dash.apply(sample_data(), 20);
        assert_eq!(v, 2);
        assert_eq!(dash.version, 2);
        assert_eq!(dash.updated_at, 20);
        assert_eq!(dash.data(), sample_data());
    }

    #[test]
    fn test_widget_type_wire_names() {
        let json = serde_json::to_string(&WidgetType::BookmarkList).unwrap();
        assert_eq!(json, "\"bookmark-list\"");
        let parsed: WidgetType = serde_json::from_str("\"rss\"").unwrap();
        assert_eq!(parsed, WidgetType::Rss);
        assert!(serde_json::from_str::<WidgetType>("\"calendar\"").is_err());
    }

    #[test]
    fn test_camel_case_shape() {
        let dash = Dashboard::new_default("u", 1);
        let value = serde_json::to_value(&dash).unwrap();
        assert!(value.get("userId").is_some());
        assert!(value.get("lastBackupAt").is_some());
        assert_eq!(value["settings"]["gridCols"], 10);
        assert_eq!(value["settings"]["background"]["type"], "gradient");
    }

    #[test]
    fn test_tab_defaults_when_missing() {
        let tab: Tab = serde_json::from_str(r#"{"id":"a","name":"A"}"#).unwrap();
        assert!(tab.widgets.is_empty());
        assert_eq!(tab.layouts, serde_json::json!({ "lg": [] }));
    }

    #[test]
    fn test_validate_ok() {
        assert!(sample_data().validate().is_ok());
    }

    #[test]
    fn test_validate_duplicate_tab() {
        let data = DashboardData::new(
            vec![Tab::new("t1", "A"), Tab::new("t1", "B")],
            Settings::default(),
        );
        assert!(matches!(data.validate(), Err(SyncError::Validation(_))));
    }

    #[test]
    fn test_validate_duplicate_widget() {
        let data = DashboardData::new(
            vec![Tab::new("t1", "A")
                .with_widget(Widget::new("w", WidgetType::Clock, "c"))
                .with_widget(Widget::new("w", WidgetType::Todo, "t"))],
            Settings::default(),
        );
        assert!(data.validate().is_err());
    }

    #[test]
    fn test_validate_grid_bounds() {
        let mut data = sample_data();
        data.settings.grid_cols = 5;
        assert!(data.validate().is_err());
        data.settings.grid_cols = 6;
        assert!(data.validate().is_ok());
        data.settings.grid_cols = 11;
        assert!(data.validate().is_err());
    }

    #[test]
    fn test_validate_empty_tab_name() {
        let data = DashboardData::new(vec![Tab::new("t1", "  ")], Settings::default());
        assert!(data.validate().is_err());
    }
}
