use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::model::Coordinates;

const HTTP_TIMEOUT_SECS: u64 = 10;

static UNIT_TOKENS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:Unit|Suite|Apt|Floor|Rm|#)\s*\d+\b").expect("unit regex"));
static VENUE_WORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:Shopping Center|Mall|Plaza|Building|Complex)\b").expect("venue regex")
});
static EXTRA_WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{2,}").expect("space regex"));

/// Strips unit/suite tokens and generic venue words before lookup. The
/// cleaned string is used for queries only; the original address is what
/// stays on the entity.
pub fn clean_address(raw: &str) -> String {
    let without_units = UNIT_TOKENS.replace_all(raw, "");
    let without_venues = VENUE_WORDS.replace_all(&without_units, "");
    EXTRA_WHITESPACE
        .replace_all(&without_venues, " ")
        .trim()
        .to_string()
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Ok(None)` means the provider answered but found nothing; both that
    /// and `Err` are retryable from the resolver's point of view.
    async fn geocode(&self, address: &str) -> AppResult<Option<Coordinates>>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.geocode_max_attempts.max(1),
            delay: Duration::from_millis(config.geocode_retry_delay_ms),
        }
    }

    #[cfg(test)]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay: Duration::ZERO,
        }
    }
}

/// Ordered provider chain with bounded retries and a shared rate limit.
/// Exhausting every provider is a normal outcome (`None`), not an error:
/// the run controller excludes the entity and reports it.
pub struct GeocodeResolver {
    providers: Vec<Arc<dyn Geocoder>>,
    policy: RetryPolicy,
    rate_limiter: RateLimiter,
}

impl GeocodeResolver {
    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        let mut providers: Vec<Arc<dyn Geocoder>> = Vec::new();
        if let Some(key) = config.google_geocode_api_key.clone() {
            providers.push(Arc::new(GoogleGeocoder::new(
                key,
                config.google_geocode_endpoint.clone(),
            )?));
        }
        providers.push(Arc::new(NominatimGeocoder::new(
            config.nominatim_endpoint.clone(),
            config.nominatim_user_agent.clone(),
        )?));

        Ok(Self {
            providers,
            policy: RetryPolicy::from_config(config),
            rate_limiter: RateLimiter::new(config.geocode_rate_limit_qps),
        })
    }

    pub fn from_providers(
        providers: Vec<Arc<dyn Geocoder>>,
        policy: RetryPolicy,
        qps: u32,
    ) -> Self {
        Self {
            providers,
            policy,
            rate_limiter: RateLimiter::new(qps.max(1)),
        }
    }

    pub fn set_rate_limit(&self, qps: u32) {
        self.rate_limiter.set_qps(qps.max(1));
    }

    pub fn rate_limit_qps(&self) -> u32 {
        self.rate_limiter.qps()
    }

    /// Resolves an address to coordinates, or `None` once every provider has
    /// exhausted its attempts.
    pub async fn resolve(&self, raw_address: &str) -> Option<Coordinates> {
        let address = clean_address(raw_address);
        if address.is_empty() {
            debug!("blank address after cleaning; skipping lookup");
            return None;
        }

        for provider in &self.providers {
            if let Some(coords) = self.resolve_with(provider.as_ref(), &address).await {
                return Some(coords);
            }
        }
        None
    }

    async fn resolve_with(&self, provider: &dyn Geocoder, address: &str) -> Option<Coordinates> {
        for attempt in 1..=self.policy.max_attempts {
            self.rate_limiter.wait().await;
            match provider.geocode(address).await {
                Ok(Some(coords)) if coords.is_valid() => {
                    trace!(provider = provider.name(), attempt, "address resolved");
                    return Some(coords);
                }
                Ok(Some(coords)) => {
                    warn!(
                        provider = provider.name(),
                        attempt,
                        latitude = coords.latitude,
                        longitude = coords.longitude,
                        "provider returned out-of-range coordinates"
                    );
                }
                Ok(None) => {
                    debug!(provider = provider.name(), attempt, "no result for address");
                }
                Err(err) => {
                    warn!(provider = provider.name(), attempt, %err, "geocode attempt failed");
                }
            }
            if attempt < self.policy.max_attempts {
                sleep(self.policy.delay).await;
            }
        }
        None
    }
}

pub struct GoogleGeocoder {
    http: reqwest::Client,
    api_key: SecretString,
    endpoint: String,
}

impl GoogleGeocoder {
    pub fn new(api_key: SecretString, endpoint: String) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            api_key,
            endpoint,
        })
    }
}

#[async_trait]
impl Geocoder for GoogleGeocoder {
    fn name(&self) -> &'static str {
        "google"
    }

    async fn geocode(&self, address: &str) -> AppResult<Option<Coordinates>> {
        #[derive(Deserialize)]
        struct Response {
            status: String,
            #[serde(default)]
            results: Vec<ResponseResult>,
        }

        #[derive(Deserialize)]
        struct ResponseResult {
            geometry: Geometry,
        }

        #[derive(Deserialize)]
        struct Geometry {
            location: Location,
        }

        #[derive(Deserialize)]
        struct Location {
            lat: f64,
            lng: f64,
        }

        let response = self
            .http
            .get(&self.endpoint)
            .query(&[
                ("address", address),
                ("key", self.api_key.expose_secret()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let parsed: Response = response.json().await?;
        match parsed.status.as_str() {
            "OK" => Ok(parsed
                .results
                .first()
                .map(|result| Coordinates::new(result.geometry.location.lat, result.geometry.location.lng))),
            "ZERO_RESULTS" => Ok(None),
            other => Err(AppError::Geocode(format!(
                "google geocoding returned status {other}"
            ))),
        }
    }
}

pub struct NominatimGeocoder {
    http: reqwest::Client,
    endpoint: String,
}

impl NominatimGeocoder {
    pub fn new(endpoint: String, user_agent: String) -> AppResult<Self> {
        // Nominatim's usage policy requires an identifying User-Agent.
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self { http, endpoint })
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    fn name(&self) -> &'static str {
        "nominatim"
    }

    async fn geocode(&self, address: &str) -> AppResult<Option<Coordinates>> {
        // Nominatim serializes lat/lon as strings.
        #[derive(Deserialize)]
        struct Place {
            lat: String,
            lon: String,
        }

        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("q", address), ("format", "json"), ("limit", "1")])
            .send()
            .await?
            .error_for_status()?;

        let places: Vec<Place> = response.json().await?;
        let Some(place) = places.into_iter().next() else {
            return Ok(None);
        };
        let latitude = place
            .lat
            .parse::<f64>()
            .map_err(|err| AppError::Geocode(format!("nominatim latitude: {err}")))?;
        let longitude = place
            .lon
            .parse::<f64>()
            .map_err(|err| AppError::Geocode(format!("nominatim longitude: {err}")))?;
        Ok(Some(Coordinates::new(latitude, longitude)))
    }
}

struct RateLimiter {
    min_interval_ms: AtomicU64,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    fn new(qps: u32) -> Self {
        Self {
            min_interval_ms: AtomicU64::new(Self::interval_ms(qps)),
            last_tick: AsyncMutex::new(None),
        }
    }

    fn set_qps(&self, qps: u32) {
        self.min_interval_ms
            .store(Self::interval_ms(qps), Ordering::SeqCst);
    }

    fn qps(&self) -> u32 {
        let interval = self.min_interval_ms.load(Ordering::SeqCst).max(1);
        let qps = (1000_f64 / interval as f64).round() as u32;
        qps.max(1)
    }

    fn interval_ms(qps: u32) -> u64 {
        let safe_qps = qps.max(1);
        let interval_ms = (1000_f64 / safe_qps as f64).ceil() as u64;
        interval_ms.max(50)
    }

    async fn wait(&self) {
        let interval = Duration::from_millis(self.min_interval_ms.load(Ordering::SeqCst));
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    struct ScriptedGeocoder {
        name: &'static str,
        responses: Mutex<Vec<AppResult<Option<Coordinates>>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedGeocoder {
        fn new(name: &'static str, responses: Vec<AppResult<Option<Coordinates>>>) -> Self {
            Self {
                name,
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().len()
        }
    }

    #[async_trait]
    impl Geocoder for ScriptedGeocoder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn geocode(&self, address: &str) -> AppResult<Option<Coordinates>> {
            self.calls.lock().push(address.to_string());
            self.responses.lock().pop().unwrap_or(Ok(None))
        }
    }

    fn point() -> Coordinates {
        Coordinates::new(43.65, -79.38)
    }

    #[test]
    fn cleans_unit_tokens_and_venue_words() {
        assert_eq!(
            clean_address("Unit 5 1250 Markham Road, Scarborough"),
            "1250 Markham Road, Scarborough"
        );
        assert_eq!(
            clean_address("1 Bass Pro Mills Drive Shopping Center, Vaughan"),
            "1 Bass Pro Mills Drive , Vaughan"
        );
        assert_eq!(clean_address("  10 Bay   Street  "), "10 Bay Street");
        assert_eq!(clean_address(""), "");
    }

    #[test]
    fn cleaning_is_case_insensitive() {
        assert_eq!(clean_address("SUITE 200 55 King Street"), "55 King Street");
        assert_eq!(clean_address("Square One MALL Mississauga"), "Square One Mississauga");
    }

    #[tokio::test]
    async fn primary_success_skips_fallback() {
        let primary = Arc::new(ScriptedGeocoder::new("primary", vec![Ok(Some(point()))]));
        let fallback = Arc::new(ScriptedGeocoder::new("fallback", vec![]));
        let resolver = GeocodeResolver::from_providers(
            vec![primary.clone(), fallback.clone()],
            RetryPolicy::immediate(3),
            20,
        );

        let coords = resolver.resolve("10 Bay Street, Toronto").await.unwrap();
        assert_eq!(coords.latitude, 43.65);
        assert_eq!(primary.call_count(), 1);
        assert_eq!(fallback.call_count(), 0);
    }

    #[tokio::test]
    async fn retries_primary_before_falling_back() {
        // Responses pop from the back: two failures, then the third attempt
        // still finds nothing, so the fallback answers.
        let primary = Arc::new(ScriptedGeocoder::new(
            "primary",
            vec![
                Ok(None),
                Err(AppError::Geocode("transient".into())),
                Err(AppError::Geocode("transient".into())),
            ],
        ));
        let fallback = Arc::new(ScriptedGeocoder::new("fallback", vec![Ok(Some(point()))]));
        let resolver = GeocodeResolver::from_providers(
            vec![primary.clone(), fallback.clone()],
            RetryPolicy::immediate(3),
            20,
        );

        let coords = resolver.resolve("700 Lawrence Avenue West").await;
        assert!(coords.is_some());
        assert_eq!(primary.call_count(), 3);
        assert_eq!(fallback.call_count(), 1);
    }

    #[tokio::test]
    async fn exhausting_all_providers_is_unresolved_not_error() {
        let primary = Arc::new(ScriptedGeocoder::new("primary", vec![]));
        let fallback = Arc::new(ScriptedGeocoder::new("fallback", vec![]));
        let resolver = GeocodeResolver::from_providers(
            vec![primary.clone(), fallback.clone()],
            RetryPolicy::immediate(2),
            20,
        );

        assert!(resolver.resolve("nowhere in particular").await.is_none());
        assert_eq!(primary.call_count(), 2);
        assert_eq!(fallback.call_count(), 2);
    }

    #[tokio::test]
    async fn blank_address_never_reaches_providers() {
        let primary = Arc::new(ScriptedGeocoder::new("primary", vec![Ok(Some(point()))]));
        let resolver =
            GeocodeResolver::from_providers(vec![primary.clone()], RetryPolicy::immediate(3), 20);

        assert!(resolver.resolve("   ").await.is_none());
        assert_eq!(primary.call_count(), 0);
    }

    #[tokio::test]
    async fn out_of_range_result_is_retried() {
        let primary = Arc::new(ScriptedGeocoder::new(
            "primary",
            vec![
                Ok(Some(point())),
                Ok(Some(Coordinates::new(400.0, 0.0))),
            ],
        ));
        let resolver =
            GeocodeResolver::from_providers(vec![primary.clone()], RetryPolicy::immediate(3), 20);

        let coords = resolver.resolve("2055 Kennedy Road").await.unwrap();
        assert_eq!(coords.latitude, 43.65);
        assert_eq!(primary.call_count(), 2);
    }

    #[tokio::test]
    async fn providers_receive_cleaned_address() {
        let primary = Arc::new(ScriptedGeocoder::new("primary", vec![Ok(Some(point()))]));
        let resolver =
            GeocodeResolver::from_providers(vec![primary.clone()], RetryPolicy::immediate(1), 20);

        resolver.resolve("Unit 12 900 Derry Road West").await;
        assert_eq!(primary.calls.lock()[0], "900 Derry Road West");
    }

    #[test]
    fn rate_limiter_reports_configured_qps() {
        let limiter = RateLimiter::new(5);
        assert_eq!(limiter.qps(), 5);
        limiter.set_qps(0);
        assert_eq!(limiter.qps(), 1);
    }
}
