use std::sync::Arc;

use crate::config::AppConfig;
use crate::history::HistoryStore;

#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub history: Arc<HistoryStore>,
}

impl AppContext {
    pub fn new(config: AppConfig) -> Self {
        let history = HistoryStore::new(&config.history_path, config.history_limit);
        Self {
            config: Arc::new(config),
            history: Arc::new(history),
        }
    }
}
