// Test doubles for the scout pipeline.
//
// One mock per trait boundary:
// - MockSource (MediaSource): location -> posts or error
// - MockVision (VisionService): scripted readings and failures
// - RecordingAlerts (AlertBackend)
// - RecordingSubscriber (PulseSubscriber)
//
// Plus helpers for building venues and media items.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use afters_common::{content_hash, MediaItem, OperatorAlert, Platform, PulseDelta, VenueTarget};

use crate::classify::{ClassificationError, VisionService};
use crate::fetch::{Identity, MediaSource, RawPost, SourceError};
use crate::notify::AlertBackend;
use crate::pulse::PulseSubscriber;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// An Instagram venue with a location URL derived from its name.
pub fn venue(name: &str, location_id: u64, now: DateTime<Utc>) -> VenueTarget {
    VenueTarget::new(
        Uuid::new_v4(),
        name,
        Platform::Instagram,
        format!(
            "https://www.instagram.com/explore/locations/{location_id}/{}/",
            name.to_lowercase().replace(' ', "-")
        ),
        0,
        now,
    )
}

/// A media item whose locator is derived from `post_key`.
pub fn media_item(venue_id: Uuid, post_key: &str, posted_at: DateTime<Utc>) -> MediaItem {
    let locator = format!("https://cdn.test/{post_key}.jpg");
    MediaItem {
        id: Uuid::new_v4(),
        venue_id,
        platform: Platform::Instagram,
        content_hash: content_hash(Platform::Instagram, post_key, &locator),
        post_key: post_key.to_string(),
        posted_at,
        media_locator: locator,
        fetched_at: posted_at,
    }
}

/// A raw post with an image, as a source would return it.
pub fn raw_post(post_key: &str, posted_at: DateTime<Utc>) -> RawPost {
    RawPost {
        post_key: post_key.to_string(),
        posted_at,
        media_locator: Some(format!("https://cdn.test/{post_key}.jpg")),
    }
}

// ---------------------------------------------------------------------------
// MockSource
// ---------------------------------------------------------------------------

type ErrorFactory = Box<dyn Fn() -> SourceError + Send + Sync>;

/// Location-keyed media source. Unregistered locations fail as network errors.
/// Builder pattern: `.on_posts()`, `.on_error()`, `.with_delay()`.
/// Responses can be swapped between crawls with `set_posts`/`set_error`.
pub struct MockSource {
    posts: Mutex<HashMap<String, Vec<RawPost>>>,
    errors: Mutex<HashMap<String, ErrorFactory>>,
    delay: Option<Duration>,
    user_agents: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl MockSource {
    pub fn new() -> Self {
        Self {
            posts: Mutex::new(HashMap::new()),
            errors: Mutex::new(HashMap::new()),
            delay: None,
            user_agents: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn on_posts(self, location: &str, posts: Vec<RawPost>) -> Self {
        self.set_posts(location, posts);
        self
    }

    pub fn on_error(self, location: &str, error: impl Fn() -> SourceError + Send + Sync + 'static) -> Self {
        self.set_error(location, error);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Replace the posts for `location`, clearing any registered error.
    pub fn set_posts(&self, location: &str, posts: Vec<RawPost>) {
        self.errors.lock().expect("lock poisoned").remove(location);
        self.posts
            .lock()
            .expect("lock poisoned")
            .insert(location.to_string(), posts);
    }

    /// Fail every fetch of `location` until replaced.
    pub fn set_error(&self, location: &str, error: impl Fn() -> SourceError + Send + Sync + 'static) {
        self.errors
            .lock()
            .expect("lock poisoned")
            .insert(location.to_string(), Box::new(error));
    }

    pub fn user_agents_seen(&self) -> Vec<String> {
        self.user_agents.lock().expect("lock poisoned").clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for MockSource {
    async fn recent_media(
        &self,
        target: &VenueTarget,
        identity: &Identity,
        limit: u32,
    ) -> Result<Vec<RawPost>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.user_agents
            .lock()
            .expect("lock poisoned")
            .push(identity.user_agent.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(make_error) = self
            .errors
            .lock()
            .expect("lock poisoned")
            .get(&target.location_source)
        {
            return Err(make_error());
        }

        self.posts
            .lock()
            .expect("lock poisoned")
            .get(&target.location_source)
            .map(|posts| posts.iter().take(limit as usize).cloned().collect())
            .ok_or_else(|| {
                SourceError::Network(format!(
                    "MockSource: no posts registered for {}",
                    target.location_source
                ))
            })
    }
}

// ---------------------------------------------------------------------------
// MockVision
// ---------------------------------------------------------------------------

/// Vision service returning a fixed valid reading unless told otherwise.
pub struct MockVision {
    default_reading: Value,
    overrides: HashMap<String, Value>,
    delay: Option<Duration>,
    failures: Mutex<(usize, Option<ClassificationError>)>,
    truncate_to: Option<usize>,
    calls: AtomicUsize,
    locators: Mutex<Vec<String>>,
}

impl MockVision {
    pub fn new() -> Self {
        Self {
            default_reading: json!({
                "energy": 7,
                "crowd": 6,
                "vibe": "Techno",
                "confidence": 0.85
            }),
            overrides: HashMap::new(),
            delay: None,
            failures: Mutex::new((0, None)),
            truncate_to: None,
            calls: AtomicUsize::new(0),
            locators: Mutex::new(Vec::new()),
        }
    }

    /// The reading returned for every locator without an override.
    pub fn with_default(mut self, reading: Value) -> Self {
        self.default_reading = reading;
        self
    }

    pub fn on_locator(mut self, locator: &str, reading: Value) -> Self {
        self.overrides.insert(locator.to_string(), reading);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next `times` calls with `error`.
    pub fn fail_times(self, times: usize, error: ClassificationError) -> Self {
        *self.failures.lock().expect("lock poisoned") = (times, Some(error));
        self
    }

    /// Return at most `n` readings per call regardless of batch size.
    pub fn truncate_responses(mut self, n: usize) -> Self {
        self.truncate_to = Some(n);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every locator sent, across all calls.
    pub fn locators_seen(&self) -> Vec<String> {
        self.locators.lock().expect("lock poisoned").clone()
    }
}

impl Default for MockVision {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VisionService for MockVision {
    async fn classify_batch(&self, locators: &[String]) -> Result<Vec<Value>, ClassificationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut failures = self.failures.lock().expect("lock poisoned");
            if failures.0 > 0 {
                failures.0 -= 1;
                if let Some(error) = failures.1.clone() {
                    return Err(error);
                }
            }
        }

        self.locators
            .lock()
            .expect("lock poisoned")
            .extend(locators.iter().cloned());

        let mut readings: Vec<Value> = locators
            .iter()
            .map(|l| {
                self.overrides
                    .get(l)
                    .cloned()
                    .unwrap_or_else(|| self.default_reading.clone())
            })
            .collect();
        if let Some(n) = self.truncate_to {
            readings.truncate(n);
        }
        Ok(readings)
    }
}

// ---------------------------------------------------------------------------
// Recorders
// ---------------------------------------------------------------------------

/// Alert backend that keeps every alert it is sent.
#[derive(Default)]
pub struct RecordingAlerts {
    alerts: Mutex<Vec<OperatorAlert>>,
}

impl RecordingAlerts {
    pub fn alerts(&self) -> Vec<OperatorAlert> {
        self.alerts.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl AlertBackend for RecordingAlerts {
    async fn send(&self, alert: &OperatorAlert) -> anyhow::Result<()> {
        self.alerts.lock().expect("lock poisoned").push(alert.clone());
        Ok(())
    }
}

/// Pulse subscriber that keeps every delta it receives.
#[derive(Default)]
pub struct RecordingSubscriber {
    deltas: Mutex<Vec<PulseDelta>>,
}

impl RecordingSubscriber {
    pub fn deltas(&self) -> Vec<PulseDelta> {
        self.deltas.lock().expect("lock poisoned").clone()
    }

    /// Deltas for one venue, in delivery order.
    pub fn for_venue(&self, venue_id: Uuid) -> Vec<PulseDelta> {
        self.deltas()
            .into_iter()
            .filter(|d| d.venue_id == venue_id)
            .collect()
    }
}

#[async_trait]
impl PulseSubscriber for RecordingSubscriber {
    async fn deliver(&self, delta: &PulseDelta) -> anyhow::Result<()> {
        self.deltas.lock().expect("lock poisoned").push(delta.clone());
        Ok(())
    }
}
