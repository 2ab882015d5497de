/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`).
    pub request_timeout_secs: u64,
    /// State store connection URL.
    pub redis_url: String,
    /// A live connection that sends nothing for this long is closed.
    pub ws_heartbeat_timeout_secs: u64,
    /// Log lines replayed to a viewer right after it connects.
    pub ws_backlog_lines: usize,
    /// Jobs older than this are removed by the retention sweep.
    pub job_retention_days: u32,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default                    |
    /// |-----------------------------|----------------------------|
    /// | `HOST`                      | `0.0.0.0`                  |
    /// | `PORT`                      | `3000`                     |
    /// | `CORS_ORIGINS`              | `http://localhost:5173`    |
    /// | `REQUEST_TIMEOUT_SECS`      | `30`                       |
    /// | `REDIS_URL`                 | `redis://127.0.0.1:6379`   |
    /// | `WS_HEARTBEAT_TIMEOUT_SECS` | `90`                       |
    /// | `WS_BACKLOG_LINES`          | `50`                       |
    /// | `JOB_RETENTION_DAYS`        | `7`                        |
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs: u64 = std::env::var("REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("REQUEST_TIMEOUT_SECS must be a valid u64");

        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());

        let ws_heartbeat_timeout_secs: u64 = std::env::var("WS_HEARTBEAT_TIMEOUT_SECS")
            .unwrap_or_else(|_| "90".into())
            .parse()
            .expect("WS_HEARTBEAT_TIMEOUT_SECS must be a valid u64");

        let ws_backlog_lines: usize = std::env::var("WS_BACKLOG_LINES")
            .unwrap_or_else(|_| "50".into())
            .parse()
            .expect("WS_BACKLOG_LINES must be a valid usize");

        let job_retention_days: u32 = std::env::var("JOB_RETENTION_DAYS")
            .unwrap_or_else(|_| "7".into())
            .parse()
            .expect("JOB_RETENTION_DAYS must be a valid u32");

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            redis_url,
            ws_heartbeat_timeout_secs,
            ws_backlog_lines,
            job_retention_days,
        }
    }
}
