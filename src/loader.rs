//! Registration loader — fetches hostname→registration siteinfo on a
//! jittered interval, emitting a registration only when it differs from the
//! last one emitted.

use crate::heartbeat::Registration;
use crate::hostname::Hostname;
use rand::Rng;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("unsupported source scheme: {0}")]
    UnsupportedScheme(String),
    #[error("hostname {0} not present in siteinfo")]
    NotFound(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Either a registration differs from what was last emitted, or it doesn't.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadResult {
    Changed(Registration),
    Unchanged,
}

/// Config for the loader's jittered reload ticker. `min <= expected <= max`.
#[derive(Debug, Clone, Copy)]
pub struct IntervalConfig {
    pub min: Duration,
    pub expected: Duration,
    pub max: Duration,
}

/// A source of siteinfo documents. `file://` and `http(s)://` are
/// implemented directly; other schemes (e.g. `gs://`) are a natural
/// extension point behind this trait.
#[async_trait::async_trait]
pub trait SiteinfoSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<HashMap<String, Registration>, LoaderError>;
}

pub struct FileSource;

#[async_trait::async_trait]
impl SiteinfoSource for FileSource {
    async fn fetch(&self, url: &str) -> Result<HashMap<String, Registration>, LoaderError> {
        let path = url
            .strip_prefix("file://")
            .ok_or_else(|| LoaderError::UnsupportedScheme(url.to_string()))?;
        let body = tokio::fs::read_to_string(Path::new(path))
            .await
            .map_err(|e| LoaderError::Fetch(e.to_string()))?;
        serde_json::from_str(&body).map_err(|e| LoaderError::Decode(e.to_string()))
    }
}

pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new() -> Self {
        HttpSource {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SiteinfoSource for HttpSource {
    async fn fetch(&self, url: &str) -> Result<HashMap<String, Registration>, LoaderError> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(LoaderError::UnsupportedScheme(url.to_string()));
        }
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| LoaderError::Fetch(e.to_string()))?;
        resp.json()
            .await
            .map_err(|e| LoaderError::Decode(e.to_string()))
    }
}

/// Picks the right `SiteinfoSource` for a URL's scheme.
pub fn source_for(url: &str) -> Result<Box<dyn SiteinfoSource>, LoaderError> {
    if url.starts_with("file://") {
        Ok(Box::new(FileSource))
    } else if url.starts_with("http://") || url.starts_with("https://") {
        Ok(Box::new(HttpSource::new()))
    } else {
        Err(LoaderError::UnsupportedScheme(url.to_string()))
    }
}

pub struct Loader {
    source_url: String,
    source: Box<dyn SiteinfoSource>,
    hostname: String,
    experiment: String,
    services: crate::heartbeat::ServiceMap,
    interval: IntervalConfig,
    last_emitted: Option<Registration>,
}

impl Loader {
    pub fn new(
        source_url: String,
        hostname: String,
        experiment: String,
        services: crate::heartbeat::ServiceMap,
        interval: IntervalConfig,
    ) -> Result<Self, LoaderError> {
        let source = source_for(&source_url)?;
        Ok(Loader {
            source_url,
            source,
            hostname,
            experiment,
            services,
            interval,
            last_emitted: None,
        })
    }

    /// Fetches the siteinfo document, looks up this loader's canonical
    /// hostname, and returns `Changed` only if it differs from the record
    /// last emitted. The returned registration carries this loader's
    /// configured experiment label and service map attached.
    pub async fn get_registration(&mut self) -> Result<LoadResult, LoaderError> {
        // Validate the hostname is canonical up front — an invalid hostname
        // is a configuration error, not a transient fetch failure.
        Hostname::parse(&self.hostname)
            .map_err(|e| LoaderError::Decode(e.to_string()))?;

        let mapping = self.source.fetch(&self.source_url).await?;
        let mut record = mapping
            .get(&self.hostname)
            .cloned()
            .ok_or_else(|| LoaderError::NotFound(self.hostname.clone()))?;

        record.experiment = self.experiment.clone();
        record.services = self.services.clone();

        if self.last_emitted.as_ref().map(registration_key) == Some(registration_key(&record)) {
            return Ok(LoadResult::Unchanged);
        }
        self.last_emitted = Some(record.clone());
        Ok(LoadResult::Changed(record))
    }

    /// Samples the next reload delay from an exponential distribution with
    /// rate `1/expected`, clipped into `[min, max]` by resampling — not
    /// clamping, which would pile probability mass at the bounds and defeat
    /// the point of spreading reloads across the fleet.
    pub fn next_delay(&self) -> Duration {
        let rate = 1.0 / self.interval.expected.as_secs_f64();
        let mut rng = rand::thread_rng();
        loop {
            let u: f64 = rng.gen_range(f64::EPSILON..1.0);
            let sample = -u.ln() / rate;
            let delay = Duration::from_secs_f64(sample);
            if delay >= self.interval.min && delay <= self.interval.max {
                return delay;
            }
        }
    }
}

/// A comparison key over the fields that matter for "did siteinfo change",
/// deliberately excluding the experiment/service-map fields this loader
/// itself attaches (those never come from siteinfo, so comparing them would
/// always agree and comparing everything else is the actual question).
fn registration_key(reg: &Registration) -> String {
    serde_json::to_string(&(
        &reg.city,
        &reg.country,
        &reg.continent,
        &reg.hostname,
        reg.latitude.get().to_bits(),
        reg.longitude.get().to_bits(),
        &reg.machine,
        &reg.metro,
        &reg.project,
        &reg.site,
        &reg.node_type,
        &reg.uplink,
        reg.probability.to_bits(),
    ))
    .expect("tuple of plain fields always serializes")
}
