use crate::models::{UsageView, WindowView};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Screen {
    Dashboard,
    ErrorDialog,
}

#[derive(Debug, Clone)]
pub struct AppState {
    pub running: bool,
    pub status: String,
    pub compact_mode: bool,
    pub view: Option<UsageView>,
    pub backend: String,
    pub last_refresh: String,
    pub screen: Screen,
    pub error_message: String,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            running: true,
            status: "ready".into(),
            compact_mode: false,
            view: None,
            backend: String::new(),
            last_refresh: "never".into(),
            screen: Screen::Dashboard,
            error_message: String::new(),
        }
    }
}

impl AppState {
    /// Windows in `order`, followed by any stored extras alphabetically.
    pub fn ordered_windows(&self, order: &[String]) -> Vec<(String, WindowView)> {
        let Some(view) = &self.view else {
            return vec![];
        };
        let mut rows: Vec<(String, WindowView)> = order
            .iter()
            .filter_map(|key| view.windows.get(key).map(|w| (key.clone(), w.clone())))
            .collect();
        for (key, window) in &view.windows {
            if !order.contains(key) {
                rows.push((key.clone(), window.clone()));
            }
        }
        rows
    }

    pub fn show_error(&mut self, message: String) {
        self.error_message = message;
        self.screen = Screen::ErrorDialog;
    }
}
