use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_GEOCODE_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_GEOCODE_RETRY_DELAY_MS: u64 = 2_000;
const DEFAULT_GEOCODE_CONCURRENCY: usize = 4;
const DEFAULT_PROXIMITY_THRESHOLD_KM: f64 = 40.0;
const DEFAULT_PERSIST_RETRY_LIMIT: u32 = 3;
const DEFAULT_NOMINATIM_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";
const DEFAULT_GOOGLE_GEOCODE_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_file_name: String,
    pub google_geocode_api_key: Option<SecretString>,
    pub google_geocode_endpoint: String,
    pub nominatim_endpoint: String,
    pub nominatim_user_agent: String,
    pub geocode_max_attempts: u32,
    pub geocode_retry_delay_ms: u64,
    pub geocode_rate_limit_qps: u32,
    pub geocode_concurrency: usize,
    pub proximity_threshold_km: f64,
    pub persist_retry_limit: u32,
    pub telemetry_enabled_by_default: bool,
    pub telemetry_batch_size: usize,
    pub telemetry_buffer_max_bytes: u64,
    pub telemetry_buffer_max_files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub database_file_name: String,
    pub has_google_geocode_key: bool,
    pub nominatim_endpoint: String,
    pub geocode_max_attempts: u32,
    pub geocode_retry_delay_ms: u64,
    pub geocode_rate_limit_qps: u32,
    pub geocode_concurrency: usize,
    pub proximity_threshold_km: f64,
    pub persist_retry_limit: u32,
    pub telemetry_enabled_by_default: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| "optishift.db".to_string()),
            google_geocode_api_key: env::var("GOOGLE_GEOCODE_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
            google_geocode_endpoint: env::var("GOOGLE_GEOCODE_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_GOOGLE_GEOCODE_ENDPOINT.to_string()),
            nominatim_endpoint: env::var("NOMINATIM_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_NOMINATIM_ENDPOINT.to_string()),
            nominatim_user_agent: env::var("NOMINATIM_USER_AGENT")
                .unwrap_or_else(|_| "optishift-geocoder/0.1.0".to_string()),
            geocode_max_attempts: parse_u32("GEOCODE_MAX_ATTEMPTS", DEFAULT_GEOCODE_MAX_ATTEMPTS)
                .max(1),
            geocode_retry_delay_ms: parse_u64(
                "GEOCODE_RETRY_DELAY_MS",
                DEFAULT_GEOCODE_RETRY_DELAY_MS,
            ),
            geocode_rate_limit_qps: parse_u32("GEOCODE_RATE_LIMIT_QPS", 3).max(1),
            geocode_concurrency: parse_usize("GEOCODE_CONCURRENCY", DEFAULT_GEOCODE_CONCURRENCY)
                .max(1),
            proximity_threshold_km: parse_f64(
                "PROXIMITY_THRESHOLD_KM",
                DEFAULT_PROXIMITY_THRESHOLD_KM,
            ),
            persist_retry_limit: parse_u32("PERSIST_RETRY_LIMIT", DEFAULT_PERSIST_RETRY_LIMIT)
                .max(1),
            telemetry_enabled_by_default: parse_bool("TELEMETRY_ENABLED", true),
            telemetry_batch_size: parse_usize("TELEMETRY_BATCH_SIZE", 25),
            telemetry_buffer_max_bytes: parse_u64("TELEMETRY_BUFFER_MAX_BYTES", 5 * 1024 * 1024),
            telemetry_buffer_max_files: parse_usize("TELEMETRY_BUFFER_MAX_FILES", 5).max(1),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            database_file_name: self.database_file_name.clone(),
            has_google_geocode_key: self.google_geocode_api_key.is_some(),
            nominatim_endpoint: self.nominatim_endpoint.clone(),
            geocode_max_attempts: self.geocode_max_attempts,
            geocode_retry_delay_ms: self.geocode_retry_delay_ms,
            geocode_rate_limit_qps: self.geocode_rate_limit_qps,
            geocode_concurrency: self.geocode_concurrency,
            proximity_threshold_km: self.proximity_threshold_km,
            persist_retry_limit: self.persist_retry_limit,
            telemetry_enabled_by_default: self.telemetry_enabled_by_default,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0)
        .unwrap_or(default)
}
