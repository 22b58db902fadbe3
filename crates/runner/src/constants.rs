use std::time::Duration;

pub const DEFAULT_ENGINE_URL: &str = "http://127.0.0.1:8000/";
pub const DEFAULT_BIND: &str = "127.0.0.1:8501";
pub const DEFAULT_HISTORY_LIMIT: usize = 20;
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const SESSION_FILE: &str = "session.json";
