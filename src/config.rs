use std::path::PathBuf;
use std::str::FromStr;

use chrono::NaiveTime;

/// Server settings, read once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    /// Shared connection password. The server refuses to start without one.
    pub password: Option<String>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    /// JSON seed for the vehicle/driver registry.
    pub registry_path: Option<PathBuf>,
    /// JSON-lines audit file. Unset means audit goes to the tracing log.
    pub audit_log: Option<PathBuf>,
    pub hours: BookingHours,
}

/// Opening hours reported alongside the blocked calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingHours {
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl Default for BookingHours {
    fn default() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or_default(),
            close: NaiveTime::from_hms_opt(18, 0, 0).unwrap_or_default(),
        }
    }
}

impl BookingHours {
    pub fn open_str(&self) -> String {
        self.open.format("%H:%M").to_string()
    }

    pub fn close_str(&self) -> String {
        self.close.format("%H:%M").to_string()
    }
}

fn parse_var<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|s| s.trim().parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let time = |key: &str, default: NaiveTime| match get(key) {
            Some(raw) => NaiveTime::parse_from_str(raw.trim(), "%H:%M").unwrap_or_else(|e| {
                tracing::warn!("{key}={raw:?} is not HH:MM ({e}), using {}", default.format("%H:%M"));
                default
            }),
            None => default,
        };
        let defaults = BookingHours::default();

        Self {
            port: parse_var(&get, "FLEETBOOK_PORT").unwrap_or(5433),
            bind: get("FLEETBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: get("FLEETBOOK_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: get("FLEETBOOK_PASSWORD").filter(|p| !p.trim().is_empty()),
            max_connections: parse_var(&get, "FLEETBOOK_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: parse_var(&get, "FLEETBOOK_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: parse_var(&get, "FLEETBOOK_METRICS_PORT"),
            tls_cert: get("FLEETBOOK_TLS_CERT"),
            tls_key: get("FLEETBOOK_TLS_KEY"),
            registry_path: get("FLEETBOOK_REGISTRY").map(PathBuf::from),
            audit_log: get("FLEETBOOK_AUDIT_LOG").map(PathBuf::from),
            hours: BookingHours {
                open: time("BOOKING_OPEN_TIME", defaults.open),
                close: time("BOOKING_CLOSE_TIME", defaults.close),
            },
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
