use std::{env, path::PathBuf, time::Duration};

/// Runtime settings, read from the process environment (and `.env`).
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    /// `None` runs against the in-memory store.
    pub database_url: Option<String>,
    pub session_store_dir: PathBuf,
    pub typing_delay: Duration,
    pub site_owner: String,
    pub business_name: String,
    pub log_level: String,
    pub admin_token_ttl_hours: i64,
    pub admin_email: Option<String>,
    pub admin_password: Option<String>,
    pub admin_name: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let port = get("PORT")
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(4000);
        let typing_delay_ms = get("TYPING_DELAY_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(900);
        let admin_token_ttl_hours = get("ADMIN_TOKEN_TTL_HOURS")
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(12);

        Self {
            port,
            database_url: resolve_database_url(&get),
            session_store_dir: get("SESSION_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sessions")),
            typing_delay: Duration::from_millis(typing_delay_ms),
            site_owner: get("SITE_OWNER").unwrap_or_else(|| "Alex".to_string()),
            business_name: get("BUSINESS_NAME").unwrap_or_else(|| "Studio".to_string()),
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            admin_token_ttl_hours,
            admin_email: get("ADMIN_EMAIL"),
            admin_password: get("ADMIN_PASSWORD"),
            admin_name: get("ADMIN_NAME").unwrap_or_else(|| "Admin".to_string()),
        }
    }
}

fn resolve_database_url<G>(get: &G) -> Option<String>
where
    G: Fn(&str) -> Option<String>,
{
    if let Some(url) = get("DATABASE_URL") {
        return Some(url);
    }
    let host = get("POSTGRES_HOST").or_else(|| get("PGHOST"))?;
    let port = get("POSTGRES_PORT")
        .or_else(|| get("PGPORT"))
        .unwrap_or_else(|| "5432".to_string());
    let user = get("POSTGRES_USER")
        .or_else(|| get("PGUSER"))
        .unwrap_or_else(|| "postgres".to_string());
    let password = get("POSTGRES_PASSWORD")
        .or_else(|| get("PGPASSWORD"))
        .unwrap_or_default();
    let db = get("POSTGRES_DB")
        .or_else(|| get("PGDATABASE"))
        .unwrap_or_else(|| "portfolio".to_string());
    Some(format!("postgres://{user}:{password}@{host}:{port}/{db}"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> Settings {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        Settings::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let s = settings(&[]);
        assert_eq!(s.port, 4000);
        assert!(s.database_url.is_none());
        assert_eq!(s.typing_delay, Duration::from_millis(900));
        assert_eq!(s.admin_token_ttl_hours, 12);
    }

    #[test]
    fn database_url_from_postgres_parts() {
        let s = settings(&[
            ("POSTGRES_HOST", "db"),
            ("POSTGRES_USER", "site"),
            ("POSTGRES_PASSWORD", "pw"),
        ]);
        assert_eq!(
            s.database_url.as_deref(),
            Some("postgres://site:pw@db:5432/portfolio")
        );
    }

    #[test]
    fn bad_numbers_fall_back() {
        let s = settings(&[("PORT", "http"), ("ADMIN_TOKEN_TTL_HOURS", "-3")]);
        assert_eq!(s.port, 4000);
        assert_eq!(s.admin_token_ttl_hours, 12);
    }
}
