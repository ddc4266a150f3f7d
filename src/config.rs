use std::str::FromStr;

/// Server configuration, loaded once at startup from the environment.
///
/// Every field has a default so the server runs unconfigured in a local/dev setting;
/// production deployments override via env vars.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub idle_timeout_sec: u64,
    pub rto_base_ms: u64,
    pub rto_max_ms: u64,
    pub max_attempts: u32,
    pub key_dir: String,
    pub db_url: String,
    pub ai_backend: String,
    pub metrics_addr: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:9999"),
            idle_timeout_sec: env_parse_or("IDLE_TIMEOUT_SEC", 600),
            rto_base_ms: env_parse_or("RTO_BASE_MS", 1000),
            rto_max_ms: env_parse_or("RTO_MAX_MS", 8000),
            max_attempts: env_parse_or("MAX_ATTEMPTS", 5),
            key_dir: env_or("KEY_DIR", "./storage/keys"),
            db_url: env_or("DB_URL", "./storage/chat.db"),
            ai_backend: env_or("AI_BACKEND", "none"),
            metrics_addr: env_or("METRICS_ADDR", "0.0.0.0:8080"),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        // SAFETY: test runs single-threaded within this process's env; no other test
        // in this module touches these keys.
        for key in [
            "BIND_ADDR",
            "IDLE_TIMEOUT_SEC",
            "RTO_BASE_MS",
            "RTO_MAX_MS",
            "MAX_ATTEMPTS",
            "KEY_DIR",
            "DB_URL",
            "AI_BACKEND",
            "METRICS_ADDR",
        ] {
            std::env::remove_var(key);
        }

        let cfg = Config::from_env();
        assert_eq!(cfg.bind_addr, "0.0.0.0:9999");
        assert_eq!(cfg.idle_timeout_sec, 600);
        assert_eq!(cfg.rto_base_ms, 1000);
        assert_eq!(cfg.rto_max_ms, 8000);
        assert_eq!(cfg.max_attempts, 5);
        assert_eq!(cfg.ai_backend, "none");
    }

    #[test]
    fn test_override() {
        std::env::set_var("MAX_ATTEMPTS", "9");
        let cfg = Config::from_env();
        assert_eq!(cfg.max_attempts, 9);
        std::env::remove_var("MAX_ATTEMPTS");
    }
}
