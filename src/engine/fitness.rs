//! Thread-safe, incremental multi-objective fitness tracking.
//!
//! A [`Fitness`] is an ordered list of objective tracks. Each track collects
//! raw sample scores and memoizes its running average until the next append.

use std::cmp::Ordering;
use std::sync::atomic::{self, AtomicU64};

use parking_lot::Mutex;

static NEXT_FITNESS_ID: AtomicU64 = AtomicU64::new(0);

/// Raw samples for a single objective.
#[derive(Debug, Clone, Default)]
pub struct ScoreTrack {
    scores: Vec<f64>,
    average: Option<f64>,
}

impl ScoreTrack {
    /// Create an empty track.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one sample, invalidating the cached average.
    pub fn push(&mut self, score: f64) {
        self.scores.push(score);
        self.average = None;
    }

    /// Append several samples.
    pub fn extend_from_slice(&mut self, scores: &[f64]) {
        if scores.is_empty() {
            return;
        }
        self.scores.extend_from_slice(scores);
        self.average = None;
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    /// Check if no samples were recorded.
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Raw samples in arrival order.
    pub fn scores(&self) -> &[f64] {
        &self.scores
    }

    /// Mean of all samples, `NaN` when empty.
    pub fn average(&mut self) -> f64 {
        if self.scores.is_empty() {
            return f64::NAN;
        }
        let scores = &self.scores;
        *self
            .average
            .get_or_insert_with(|| scores.iter().sum::<f64>() / scores.len() as f64)
    }
}

/// Errors raised by fitness evaluation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FitnessError {
    /// A track average lies above the theoretical maximum. The scoring
    /// function produced an impossible score.
    #[error("Score has exceeded convergence value: track {track} averaged {average} > {target}")]
    ExceededConvergence {
        track: usize,
        average: f64,
        target: f64,
    },
}

/// Accumulated multi-objective performance record.
///
/// Every fitness carries a process-wide unique `id` that is kept by
/// [`Fitness::snapshot`] and used as the last ranking tie-breaker.
#[derive(Debug)]
pub struct Fitness {
    id: u64,
    tracks: Mutex<Vec<ScoreTrack>>,
}

impl Fitness {
    /// Create an empty fitness.
    pub fn new() -> Self {
        Self::with_tracks(Vec::new())
    }

    fn with_tracks(tracks: Vec<ScoreTrack>) -> Self {
        Self {
            id: NEXT_FITNESS_ID.fetch_add(1, atomic::Ordering::Relaxed),
            tracks: Mutex::new(tracks),
        }
    }

    /// Create a fitness holding one sample per objective.
    pub fn from_scores(scores: &[f64]) -> Self {
        let fitness = Self::new();
        fitness.add_scores(scores);
        fitness
    }

    /// Stable identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Add one sample per objective; score `i` goes to track `i`.
    pub fn add_scores(&self, scores: &[f64]) {
        let mut tracks = self.tracks.lock();
        for (i, &score) in scores.iter().enumerate() {
            if i == tracks.len() {
                tracks.push(ScoreTrack::new());
            }
            tracks[i].push(score);
        }
    }

    /// Append every sample of `other` to the matching track of `self`.
    pub fn merge(&self, other: &Fitness) {
        let incoming: Vec<ScoreTrack> = other.tracks.lock().clone();
        let mut tracks = self.tracks.lock();
        for (i, track) in incoming.iter().enumerate() {
            if i == tracks.len() {
                tracks.push(ScoreTrack::new());
            }
            tracks[i].extend_from_slice(track.scores());
        }
    }

    /// Deep copy sharing the same id.
    pub fn snapshot(&self) -> Fitness {
        Fitness {
            id: self.id,
            tracks: Mutex::new(self.tracks.lock().clone()),
        }
    }

    /// Number of objectives.
    pub fn track_count(&self) -> usize {
        self.tracks.lock().len()
    }

    /// Samples of the least sampled objective.
    pub fn sample_count(&self) -> usize {
        self.tracks
            .lock()
            .iter()
            .map(ScoreTrack::len)
            .min()
            .unwrap_or(0)
    }

    /// Average score per objective.
    pub fn averages(&self) -> Vec<f64> {
        self.tracks.lock().iter_mut().map(ScoreTrack::average).collect()
    }

    /// Check whether every objective averages within `[target - tolerance, target]`
    /// over at least `min_samples` samples.
    ///
    /// An average above `target` is reported as [`FitnessError::ExceededConvergence`].
    /// A fitness without objectives, or with a `NaN` average, has not converged.
    pub fn has_converged(
        &self,
        min_samples: usize,
        target: f64,
        tolerance: f64,
    ) -> Result<bool, FitnessError> {
        let mut tracks = self.tracks.lock();
        if tracks.is_empty() {
            return Ok(false);
        }
        let samples = tracks.iter().map(ScoreTrack::len).min().unwrap_or(0);
        if min_samples > samples {
            return Ok(false);
        }

        let mut converged = true;
        for (track, scores) in tracks.iter_mut().enumerate() {
            let average = scores.average();
            if average > target {
                return Err(FitnessError::ExceededConvergence {
                    track,
                    average,
                    target,
                });
            }
            if average.is_nan() || average < target - tolerance {
                converged = false;
            }
        }
        Ok(converged)
    }

    /// Value ordering: fewer objectives first, then per objective by average
    /// (`NaN` lowest) and sample count. `Greater` means better.
    pub fn compare(&self, other: &Fitness) -> Ordering {
        if std::ptr::eq(self, other) {
            return Ordering::Equal;
        }
        let a = self.summary();
        let b = other.summary();

        a.len().cmp(&b.len()).then_with(|| {
            a.iter()
                .zip(b.iter())
                .map(|(&(a_avg, a_len), &(b_avg, b_len))| {
                    compare_average(a_avg, b_avg).then(a_len.cmp(&b_len))
                })
                .find(|ordering| ordering.is_ne())
                .unwrap_or(Ordering::Equal)
        })
    }

    fn summary(&self) -> Vec<(f64, usize)> {
        self.tracks
            .lock()
            .iter_mut()
            .map(|track| (track.average(), track.len()))
            .collect()
    }
}

impl Default for Fitness {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Fitness {
    fn clone(&self) -> Self {
        self.snapshot()
    }
}

/// Compare two averages with `NaN` ranked below every number.
pub fn compare_average(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    #[test]
    fn test_track_average_invalidated_on_push() {
        let mut track = ScoreTrack::new();
        assert!(track.average().is_nan());

        track.push(1.0);
        track.push(0.0);
        assert!((track.average() - 0.5).abs() < 1e-12);

        track.push(1.0);
        assert!((track.average() - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_sample_count_is_minimum() {
        let fitness = Fitness::new();
        fitness.add_scores(&[1.0, 0.5]);
        fitness.add_scores(&[1.0]);
        assert_eq!(fitness.track_count(), 2);
        assert_eq!(fitness.sample_count(), 1);

        assert_eq!(Fitness::new().sample_count(), 0);
    }

    #[test]
    fn test_has_converged_exact_target() {
        let fitness = Fitness::new();
        for _ in 0..12 {
            fitness.add_scores(&[1.0, 1.0]);
        }
        assert_eq!(fitness.has_converged(10, 1.0, 0.0), Ok(true));
        assert_eq!(fitness.has_converged(13, 1.0, 0.0), Ok(false));
    }

    #[test]
    fn test_has_converged_exceeded() {
        let fitness = Fitness::new();
        for _ in 0..12 {
            fitness.add_scores(&[1.0, 1.01]);
        }
        let err = fitness.has_converged(10, 1.0, 0.0).unwrap_err();
        assert!(matches!(
            err,
            FitnessError::ExceededConvergence { track: 1, .. }
        ));
    }

    #[test]
    fn test_has_converged_tolerance() {
        let fitness = Fitness::from_scores(&[0.96]);
        assert_eq!(fitness.has_converged(1, 1.0, 0.05), Ok(true));
        assert_eq!(fitness.has_converged(1, 1.0, 0.01), Ok(false));
        assert_eq!(fitness.has_converged(0, 1.0, 0.0), Ok(false));
    }

    #[test]
    fn test_has_converged_empty_and_nan() {
        assert_eq!(Fitness::new().has_converged(0, 1.0, 0.0), Ok(false));
        assert_eq!(
            Fitness::from_scores(&[f64::NAN]).has_converged(0, 1.0, 0.0),
            Ok(false)
        );
    }

    #[test]
    fn test_merge_and_snapshot() {
        let global = Fitness::new();
        global.merge(&Fitness::from_scores(&[1.0, 0.0]));
        global.merge(&Fitness::from_scores(&[0.0, 1.0]));
        assert_eq!(global.sample_count(), 2);
        assert_eq!(global.averages(), vec![0.5, 0.5]);

        let snapshot = global.snapshot();
        global.add_scores(&[1.0, 1.0]);
        assert_eq!(snapshot.id(), global.id());
        assert_eq!(snapshot.sample_count(), 2);
        assert_eq!(global.sample_count(), 3);
    }

    #[test]
    fn test_merge_self() {
        let fitness = Fitness::from_scores(&[1.0]);
        fitness.merge(&fitness);
        assert_eq!(fitness.sample_count(), 2);
    }

    #[test]
    fn test_compare_nan_lowest() {
        let nan = Fitness::from_scores(&[f64::NAN]);
        let low = Fitness::from_scores(&[0.2]);
        let high = Fitness::from_scores(&[0.9]);
        assert_eq!(nan.compare(&low), Ordering::Less);
        assert_eq!(high.compare(&low), Ordering::Greater);
        assert_eq!(high.compare(&high), Ordering::Equal);
    }

    #[test]
    fn test_compare_sample_count_breaks_ties() {
        let once = Fitness::from_scores(&[0.5]);
        let twice = Fitness::from_scores(&[0.5]);
        twice.add_scores(&[0.5]);
        assert_eq!(twice.compare(&once), Ordering::Greater);
    }

    #[test]
    fn test_concurrent_add_scores() {
        let fitness = Arc::new(Fitness::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let fitness = Arc::clone(&fitness);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        fitness.add_scores(&[1.0, 0.0]);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(fitness.sample_count(), 800);
        assert_eq!(fitness.averages(), vec![1.0, 0.0]);
    }

    proptest! {
        #[test]
        fn prop_compare_antisymmetric(a in prop::collection::vec(0.0f64..1.0, 1..4),
                                      b in prop::collection::vec(0.0f64..1.0, 1..4)) {
            let fa = Fitness::from_scores(&a);
            let fb = Fitness::from_scores(&b);
            prop_assert_eq!(fa.compare(&fb), fb.compare(&fa).reverse());
        }

        #[test]
        fn prop_average_matches_mean(scores in prop::collection::vec(-10.0f64..10.0, 1..64)) {
            let mut track = ScoreTrack::new();
            for &s in &scores {
                track.push(s);
            }
            let mean = scores.iter().sum::<f64>() / scores.len() as f64;
            prop_assert!((track.average() - mean).abs() < 1e-9);
        }
    }
}
