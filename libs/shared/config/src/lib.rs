use std::env;
use tracing::warn;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_jwt_secret: String,
    pub supabase_service_role_key: String,
    pub supabase_realtime_url: String,
    pub realtime_poll_interval_ms: u64,
    pub realtime_heartbeat_interval_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let supabase_url = env::var("SUPABASE_URL")
            .unwrap_or_else(|_| {
                warn!("SUPABASE_URL not set, using empty value");
                String::new()
            });

        let config = Self {
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            supabase_service_role_key: env::var("SUPABASE_SERVICE_ROLE_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_SERVICE_ROLE_KEY not set, admin operations are disabled");
                    String::new()
                }),
            supabase_realtime_url: env::var("SUPABASE_REALTIME_URL")
                .unwrap_or_else(|_| realtime_url_from(&supabase_url)),
            realtime_poll_interval_ms: parse_or_default(
                "REALTIME_POLL_INTERVAL_MS",
                DEFAULT_POLL_INTERVAL_MS,
            ),
            realtime_heartbeat_interval_secs: parse_or_default(
                "REALTIME_HEARTBEAT_INTERVAL_SECS",
                DEFAULT_HEARTBEAT_INTERVAL_SECS,
            ),
            supabase_url,
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.supabase_jwt_secret.is_empty()
    }

    pub fn is_admin_configured(&self) -> bool {
        !self.supabase_url.is_empty() && !self.supabase_service_role_key.is_empty()
    }
}

/// Maps `https://x.supabase.co` to `wss://x.supabase.co/realtime/v1`.
pub fn realtime_url_from(supabase_url: &str) -> String {
    let trimmed = supabase_url.trim_end_matches('/');
    let ws = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        trimmed.to_string()
    };

    format!("{}/realtime/v1", ws)
}

fn parse_or_default(key: &str, default: u64) -> u64 {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{} is not a valid number ({}), using {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}
