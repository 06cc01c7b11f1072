//! Round-trip latency probing of upstream sources.
//!
//! `LatencyProbe` keeps only the most recent sample per source. Probes for
//! different sources run concurrently; a source never has more than one
//! probe outstanding. Every cycle captures the probe epoch before it starts
//! and drops its results if the epoch moved while it was running (stop,
//! source switch). In-flight requests are not aborted.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::join_all;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vod_proto::config::{LatencyConfig, Settings};
use vod_proto::protocol::{LatencySample, PingRequest, PingResponse, VideoSource};

/// Measures one round trip to a base URL. Failures are `None`.
#[async_trait]
pub trait LatencyPinger: Send + Sync {
    async fn ping(&self, base_url: &str) -> Option<u64>;
}

/// Time a plain GET against `url`. Any non-success status is a failure.
pub async fn measure_round_trip(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Option<u64> {
    let start = Instant::now();
    match client.get(url).timeout(timeout).send().await {
        Ok(resp) if resp.status().is_success() => Some(start.elapsed().as_millis() as u64),
        Ok(resp) => {
            debug!("probe {}: status {}", url, resp.status());
            None
        }
        Err(e) => {
            debug!("probe {}: {}", url, e);
            None
        }
    }
}

/// Times the source's base URL from this process.
pub struct DirectPinger {
    client: reqwest::Client,
    timeout: Duration,
}

impl DirectPinger {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl LatencyPinger for DirectPinger {
    async fn ping(&self, base_url: &str) -> Option<u64> {
        measure_round_trip(&self.client, base_url, self.timeout).await
    }
}

/// Asks a probe endpoint (`POST {url}` → `{latency}`) to do the timing.
pub struct EndpointPinger {
    client: reqwest::Client,
    endpoint: String,
}

impl EndpointPinger {
    pub fn new(client: reqwest::Client, endpoint: String) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl LatencyPinger for EndpointPinger {
    async fn ping(&self, base_url: &str) -> Option<u64> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&PingRequest {
                url: base_url.to_string(),
            })
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        resp.json::<PingResponse>().await.ok().map(|r| r.latency)
    }
}

/// Pick the pinger the config asks for.
pub fn pinger_from_config(
    client: reqwest::Client,
    config: &LatencyConfig,
) -> Arc<dyn LatencyPinger> {
    match &config.endpoint {
        Some(endpoint) => Arc::new(EndpointPinger::new(client, endpoint.clone())),
        None => Arc::new(DirectPinger::new(
            client,
            Duration::from_millis(config.timeout_ms),
        )),
    }
}

/// Something to probe: a source id and the URL to time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub source_id: String,
    pub base_url: String,
}

impl ProbeTarget {
    /// One target per source id, first base URL wins.
    pub fn from_sources(sources: &[VideoSource]) -> Vec<Self> {
        let mut seen = HashSet::new();
        sources
            .iter()
            .filter(|s| seen.insert(s.id.clone()))
            .map(|s| Self {
                source_id: s.id.clone(),
                base_url: s.base_url.clone(),
            })
            .collect()
    }
}

/// Sent to observers after samples were merged.
#[derive(Debug, Clone)]
pub struct LatencyUpdate {
    pub updated: Vec<String>,
}

struct ProbeInner {
    pinger: Arc<dyn LatencyPinger>,
    timeout: Duration,
    interval: Duration,
    settings: watch::Receiver<Settings>,
    samples: RwLock<HashMap<String, LatencySample>>,
    in_flight: Mutex<HashSet<String>>,
    targets: RwLock<Vec<ProbeTarget>>,
    epoch: AtomicU64,
    updates: broadcast::Sender<LatencyUpdate>,
}

struct ProbeTimer {
    token: CancellationToken,
    _handle: JoinHandle<()>,
}

/// Releases a source's in-flight claim when the probe finishes or is dropped.
struct InFlightGuard<'a> {
    inner: &'a ProbeInner,
    source_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.inner.in_flight.lock() {
            set.remove(&self.source_id);
        }
    }
}

#[derive(Clone)]
pub struct LatencyProbe {
    inner: Arc<ProbeInner>,
    timer: Arc<Mutex<Option<ProbeTimer>>>,
}

impl LatencyProbe {
    pub fn new(
        pinger: Arc<dyn LatencyPinger>,
        config: &LatencyConfig,
        settings: watch::Receiver<Settings>,
    ) -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ProbeInner {
                pinger,
                timeout: Duration::from_millis(config.timeout_ms),
                interval: Duration::from_millis(config.interval_ms.max(1)),
                settings,
                samples: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
                targets: RwLock::new(Vec::new()),
                epoch: AtomicU64::new(0),
                updates,
            }),
            timer: Arc::new(Mutex::new(None)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LatencyUpdate> {
        self.inner.updates.subscribe()
    }

    /// Latest latency per source id.
    pub fn latencies(&self) -> HashMap<String, u64> {
        self.inner.latencies()
    }

    pub fn sample(&self, source_id: &str) -> Option<LatencySample> {
        self.inner
            .samples
            .read()
            .ok()
            .and_then(|s| s.get(source_id).cloned())
    }

    pub fn targets(&self) -> Vec<ProbeTarget> {
        self.inner.current_targets()
    }

    /// Replace the probed source set. Existing samples are kept.
    pub fn set_sources(&self, sources: &[VideoSource]) {
        if let Ok(mut targets) = self.inner.targets.write() {
            *targets = ProbeTarget::from_sources(sources);
        }
    }

    /// Drop the results of every probe that is currently running.
    pub fn invalidate(&self) -> u64 {
        self.inner.invalidate()
    }

    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    /// Single measurement with a bounded timeout. `None` on any failure, and
    /// when a probe for this source is already outstanding.
    pub async fn probe_one(&self, source_id: &str, base_url: &str) -> Option<u64> {
        self.inner.probe_one(source_id, base_url).await
    }

    /// Probe every target concurrently, merge the successes and return all
    /// results keyed by source id.
    pub async fn probe_all(&self, targets: &[ProbeTarget]) -> HashMap<String, Option<u64>> {
        self.inner.probe_all(targets).await
    }

    pub async fn refresh_one(&self, source_id: &str) -> Option<u64> {
        let target = self
            .inner
            .current_targets()
            .into_iter()
            .find(|t| t.source_id == source_id)?;
        let epoch = self.epoch();
        let latency = self.probe_one(&target.source_id, &target.base_url).await;
        if let Some(ms) = latency {
            self.inner.merge(epoch, &[(target.source_id, ms)]);
        }
        latency
    }

    pub async fn refresh_all(&self) -> HashMap<String, Option<u64>> {
        let targets = self.inner.current_targets();
        self.probe_all(&targets).await
    }

    pub fn is_running(&self) -> bool {
        self.timer
            .lock()
            .map(|t| t.as_ref().is_some_and(|t| !t.token.is_cancelled()))
            .unwrap_or(false)
    }

    /// Start or stop the periodic timer to match the current preference and
    /// source set. Returns whether the timer is running afterwards.
    pub fn sync(&self) -> bool {
        let enabled = self.inner.settings.borrow().realtime_latency;
        if !enabled || self.inner.current_targets().is_empty() {
            // A running timer may have a cycle in flight; its results go too.
            if self.cancel_timer() {
                self.invalidate();
            }
            return false;
        }
        if self.is_running() {
            return true;
        }

        let token = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            run_timer(inner, task_token).await;
        });

        if let Ok(mut timer) = self.timer.lock() {
            *timer = Some(ProbeTimer {
                token,
                _handle: handle,
            });
        }
        info!("latency probe: timer started ({:?})", self.inner.interval);
        true
    }

    /// Cancel the timer and discard results of probes still in flight.
    pub fn stop(&self) {
        self.cancel_timer();
        self.invalidate();
    }

    /// Returns whether a timer had been started.
    fn cancel_timer(&self) -> bool {
        let timer = self.timer.lock().ok().and_then(|mut t| t.take());
        match timer {
            Some(timer) => {
                timer.token.cancel();
                info!("latency probe: timer stopped");
                true
            }
            None => false,
        }
    }
}

async fn run_timer(inner: Arc<ProbeInner>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !inner.wanted() {
            inner.invalidate();
            break;
        }
        let targets = inner.current_targets();
        if targets.is_empty() {
            break;
        }

        let epoch = inner.epoch.load(Ordering::SeqCst);
        let results = inner.measure(&targets).await;
        // Observers or the preference may have gone while the cycle ran.
        if !inner.wanted() {
            inner.invalidate();
            break;
        }
        inner.merge(epoch, &successes(&results));
    }
    token.cancel();
}

fn successes(results: &[(String, Option<u64>)]) -> Vec<(String, u64)> {
    results
        .iter()
        .filter_map(|(id, latency)| latency.map(|ms| (id.clone(), ms)))
        .collect()
}

impl ProbeInner {
    fn latencies(&self) -> HashMap<String, u64> {
        self.samples
            .read()
            .map(|s| s.iter().map(|(id, sample)| (id.clone(), sample.latency_ms)).collect())
            .unwrap_or_default()
    }

    fn current_targets(&self) -> Vec<ProbeTarget> {
        self.targets.read().map(|t| t.clone()).unwrap_or_default()
    }

    fn claim(&self, source_id: &str) -> Option<InFlightGuard<'_>> {
        let mut set = self.in_flight.lock().ok()?;
        if !set.insert(source_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            inner: self,
            source_id: source_id.to_string(),
        })
    }

    async fn probe_one(&self, source_id: &str, base_url: &str) -> Option<u64> {
        let Some(_guard) = self.claim(source_id) else {
            debug!("probe {}: already in flight", source_id);
            return None;
        };
        match tokio::time::timeout(self.timeout, self.pinger.ping(base_url)).await {
            Ok(latency) => latency,
            Err(_) => {
                debug!("probe {}: timed out after {:?}", source_id, self.timeout);
                None
            }
        }
    }

    fn invalidate(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Whether the timer still has a reason to run.
    fn wanted(&self) -> bool {
        if self.updates.receiver_count() == 0 {
            debug!("latency probe: no observers left");
            return false;
        }
        if !self.settings.borrow().realtime_latency {
            debug!("latency probe: preference turned off");
            return false;
        }
        true
    }

    async fn measure(&self, targets: &[ProbeTarget]) -> Vec<(String, Option<u64>)> {
        join_all(targets.iter().map(|t| async move {
            let latency = self.probe_one(&t.source_id, &t.base_url).await;
            (t.source_id.clone(), latency)
        }))
        .await
    }

    async fn probe_all(&self, targets: &[ProbeTarget]) -> HashMap<String, Option<u64>> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        let results = self.measure(targets).await;
        self.merge(epoch, &successes(&results));
        results.into_iter().collect()
    }

    /// Last-write-wins per source. Failed probes never reach here, so the
    /// previous sample survives a transient failure.
    fn merge(&self, epoch: u64, measured: &[(String, u64)]) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            debug!("latency probe: dropping {} stale result(s)", measured.len());
            return;
        }
        if measured.is_empty() {
            return;
        }
        let now = chrono::Local::now();
        match self.samples.write() {
            Ok(mut samples) => {
                for (id, ms) in measured {
                    samples.insert(
                        id.clone(),
                        LatencySample {
                            source_id: id.clone(),
                            latency_ms: *ms,
                            measured_at: now,
                        },
                    );
                }
            }
            Err(e) => {
                warn!("latency probe: sample map poisoned: {}", e);
                return;
            }
        }
        let _ = self.updates.send(LatencyUpdate {
            updated: measured.iter().map(|(id, _)| id.clone()).collect(),
        });
    }
}
