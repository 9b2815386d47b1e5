//! Parallel validation of candidate devices.
//!
//! Every candidate is probed concurrently. Results are collected as they
//! arrive until all probes are in or the watchdog fires, whichever comes
//! first. Stragglers are cancelled.

use crate::probe::{DeviceProbe, ProbeResult};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Per-round fan-in record
#[derive(Debug)]
pub struct FanIn {
    pending: usize,
    results: Vec<(usize, ProbeResult)>,
    finalized: bool,
}

impl FanIn {
    pub fn new(expected: usize) -> Self {
        Self {
            pending: expected,
            results: Vec::with_capacity(expected),
            finalized: false,
        }
    }

    /// Store the result of the probe for input position `index`
    pub fn record(&mut self, index: usize, result: ProbeResult) {
        if self.finalized {
            return;
        }
        self.pending = self.pending.saturating_sub(1);
        self.results.push((index, result));
    }

    /// Count down a probe that ended without a result
    pub fn abandon(&mut self) {
        self.pending = self.pending.saturating_sub(1);
    }

    pub fn is_settled(&self) -> bool {
        self.pending == 0
    }

    /// Results in input order. `Some` on the first call only.
    pub fn finalize(&mut self) -> Option<Vec<ProbeResult>> {
        if self.finalized {
            return None;
        }
        self.finalized = true;
        let mut results = std::mem::take(&mut self.results);
        results.sort_by_key(|(index, _)| *index);
        Some(results.into_iter().map(|(_, result)| result).collect())
    }
}

/// Outcome of a completed validation round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport {
    /// Results received before finalization, in input order
    pub results: Vec<ProbeResult>,
    /// The watchdog fired before every probe finished
    pub timed_out: bool,
    /// First working device, else the first candidate, else `None`
    pub selected: Option<PathBuf>,
}

impl ValidationReport {
    pub fn working(&self) -> impl Iterator<Item = &ProbeResult> {
        self.results.iter().filter(|r| r.works)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Complete(ValidationReport),
    /// A newer round started before this one finished; its results are void
    Superseded,
}

/// Deterministic pick: first working result in input order, otherwise the first candidate
pub fn select_device(results: &[ProbeResult], candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates
        .iter()
        .find(|candidate| results.iter().any(|r| r.works && &r.device == *candidate))
        .or_else(|| candidates.first())
        .cloned()
}

pub struct ParallelValidator<P> {
    probe: Arc<P>,
    watchdog: Duration,
    generation: AtomicU64,
}

impl<P: DeviceProbe> ParallelValidator<P> {
    pub fn new(probe: Arc<P>, watchdog: Duration) -> Self {
        Self {
            probe,
            watchdog,
            generation: AtomicU64::new(0),
        }
    }

    pub fn probe(&self) -> &Arc<P> {
        &self.probe
    }

    /// Void any round still in flight
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn validate(&self, devices: &[PathBuf]) -> Validation {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let mut fan_in = FanIn::new(devices.len());
        let mut probes = JoinSet::new();
        for (index, device) in devices.iter().cloned().enumerate() {
            let probe = self.probe.clone();
            probes.spawn(async move { (index, probe.probe(&device).await) });
        }

        let watchdog = tokio::time::sleep(self.watchdog);
        tokio::pin!(watchdog);
        let mut timed_out = false;

        while !fan_in.is_settled() {
            tokio::select! {
                joined = probes.join_next() => match joined {
                    Some(Ok((index, result))) => fan_in.record(index, result),
                    Some(Err(e)) => {
                        warn!(error = %e, "probe task ended without a result");
                        fan_in.abandon();
                    }
                    None => break,
                },
                _ = &mut watchdog => {
                    timed_out = true;
                    break;
                }
            }
        }
        probes.abort_all();

        let Some(results) = fan_in.finalize() else {
            return Validation::Superseded;
        };
        if self.generation.load(Ordering::SeqCst) != generation {
            debug!(generation, "validation round superseded");
            return Validation::Superseded;
        }
        if timed_out {
            warn!(
                received = results.len(),
                expected = devices.len(),
                "validation watchdog fired, using partial results"
            );
        }

        let selected = select_device(&results, devices);
        Validation::Complete(ValidationReport {
            results,
            timed_out,
            selected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeStage;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::future::Future;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    /// Probe with canned answers and delays per device
    struct FakeProbe {
        outcomes: HashMap<PathBuf, (bool, Duration)>,
        started: AtomicUsize,
    }

    impl FakeProbe {
        fn new(outcomes: &[(&str, bool, u64)]) -> Arc<Self> {
            Arc::new(Self {
                outcomes: outcomes
                    .iter()
                    .map(|(path, works, ms)| (PathBuf::from(path), (*works, Duration::from_millis(*ms))))
                    .collect(),
                started: AtomicUsize::new(0),
            })
        }
    }

    impl DeviceProbe for FakeProbe {
        fn probe(&self, device: &Path) -> impl Future<Output = ProbeResult> + Send {
            self.started.fetch_add(1, Ordering::SeqCst);
            let (works, delay) = self
                .outcomes
                .get(device)
                .copied()
                .unwrap_or((false, Duration::ZERO));
            let device = device.to_path_buf();
            async move {
                tokio::time::sleep(delay).await;
                ProbeResult {
                    device,
                    works,
                    stage: if works { ProbeStage::Capture } else { ProbeStage::Capability },
                    latency_ms: delay.as_millis() as u64,
                }
            }
        }
    }

    fn paths(list: &[&str]) -> Vec<PathBuf> {
        list.iter().map(PathBuf::from).collect()
    }

    fn complete(validation: Validation) -> ValidationReport {
        match validation {
            Validation::Complete(report) => report,
            Validation::Superseded => panic!("round unexpectedly superseded"),
        }
    }

    #[tokio::test]
    async fn test_selects_working_device() {
        let probe = FakeProbe::new(&[("/dev/video0", false, 10), ("/dev/video2", true, 20)]);
        let validator = ParallelValidator::new(probe.clone(), Duration::from_secs(5));

        let report = complete(validator.validate(&paths(&["/dev/video0", "/dev/video2"])).await);
        assert_eq!(report.selected, Some(PathBuf::from("/dev/video2")));
        assert_eq!(report.results.len(), 2);
        assert!(!report.timed_out);
        assert_eq!(probe.started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_working_device_selects_first_candidate() {
        let probe = FakeProbe::new(&[("/dev/video3", false, 0), ("/dev/video1", false, 0)]);
        let validator = ParallelValidator::new(probe, Duration::from_secs(5));

        let report = complete(validator.validate(&paths(&["/dev/video3", "/dev/video1"])).await);
        assert_eq!(report.selected, Some(PathBuf::from("/dev/video3")));
        assert_eq!(report.working().count(), 0);
    }

    #[tokio::test]
    async fn test_input_order_breaks_ties() {
        // video1 finishes first, video0 is still preferred
        let probe = FakeProbe::new(&[("/dev/video0", true, 100), ("/dev/video1", true, 0)]);
        let validator = ParallelValidator::new(probe, Duration::from_secs(5));

        let report = complete(validator.validate(&paths(&["/dev/video0", "/dev/video1"])).await);
        assert_eq!(report.selected, Some(PathBuf::from("/dev/video0")));
        assert_eq!(report.results[0].device, PathBuf::from("/dev/video0"));
    }

    #[tokio::test]
    async fn test_watchdog_finalizes_with_partial_results() {
        let probe = FakeProbe::new(&[("/dev/video0", true, 60_000), ("/dev/video1", true, 10)]);
        let validator = ParallelValidator::new(probe, Duration::from_millis(200));

        let started = Instant::now();
        let report = complete(validator.validate(&paths(&["/dev/video0", "/dev/video1"])).await);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(report.timed_out);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.selected, Some(PathBuf::from("/dev/video1")));
    }

    #[tokio::test]
    async fn test_empty_candidates() {
        let validator = ParallelValidator::new(FakeProbe::new(&[]), Duration::from_secs(5));
        let report = complete(validator.validate(&[]).await);
        assert!(report.results.is_empty());
        assert_eq!(report.selected, None);
    }

    #[tokio::test]
    async fn test_newer_round_supersedes_older() {
        let probe = FakeProbe::new(&[("/dev/video0", true, 300), ("/dev/video1", true, 0)]);
        let validator = Arc::new(ParallelValidator::new(probe, Duration::from_secs(5)));

        let older = {
            let validator = validator.clone();
            tokio::spawn(async move { validator.validate(&paths(&["/dev/video0"])).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let newer = validator.validate(&paths(&["/dev/video1"])).await;

        assert_eq!(older.await.unwrap(), Validation::Superseded);
        assert_eq!(
            complete(newer).selected,
            Some(PathBuf::from("/dev/video1"))
        );
    }

    #[test]
    fn test_fan_in_finalizes_once() {
        let mut fan_in = FanIn::new(2);
        fan_in.record(
            1,
            ProbeResult {
                device: PathBuf::from("/dev/video1"),
                works: true,
                stage: ProbeStage::Capture,
                latency_ms: 5,
            },
        );
        assert!(!fan_in.is_settled());
        fan_in.abandon();
        assert!(fan_in.is_settled());

        let first = fan_in.finalize().unwrap();
        assert_eq!(first.len(), 1);
        assert!(fan_in.finalize().is_none());

        // Late arrivals after finalization are dropped
        fan_in.record(
            0,
            ProbeResult {
                device: PathBuf::from("/dev/video0"),
                works: true,
                stage: ProbeStage::Capture,
                latency_ms: 5,
            },
        );
        assert!(fan_in.finalize().is_none());
    }

    // **Property: selection is the first working candidate, else the first candidate**
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_selection_is_deterministic(works in proptest::collection::vec(any::<bool>(), 0..12)) {
            let candidates: Vec<PathBuf> = (0..works.len())
                .map(|i| PathBuf::from(format!("/dev/video{}", i)))
                .collect();
            // Results arrive in reverse order
            let results: Vec<ProbeResult> = works
                .iter()
                .enumerate()
                .rev()
                .map(|(i, w)| ProbeResult {
                    device: candidates[i].clone(),
                    works: *w,
                    stage: ProbeStage::Capture,
                    latency_ms: 0,
                })
                .collect();

            let expected = works
                .iter()
                .position(|w| *w)
                .or(if works.is_empty() { None } else { Some(0) })
                .map(|i| candidates[i].clone());
            prop_assert_eq!(select_device(&results, &candidates), expected);
        }
    }
}
