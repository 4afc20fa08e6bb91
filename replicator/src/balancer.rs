//! Decaying max-min fair choice between repair queues.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

/// Picks the contender with the least accumulated weight. Weights decay by
/// half every `half_life`, so recently busy contenders regain priority.
#[derive(Debug, Clone)]
pub struct DecayingMaxMinBalancer<K: Ord + Copy> {
    half_life: Duration,
    contenders: BTreeMap<K, f64>,
    last_decay: Option<DateTime<Utc>>,
}

impl<K: Ord + Copy> DecayingMaxMinBalancer<K> {
    pub fn new(half_life: Duration) -> Self {
        Self {
            half_life,
            contenders: BTreeMap::new(),
            last_decay: None,
        }
    }

    pub fn set_half_life(&mut self, half_life: Duration) {
        self.half_life = half_life;
    }

    /// Registers a contender with zero weight; existing weights are kept.
    pub fn add_contender(&mut self, contender: K) {
        self.contenders.entry(contender).or_insert(0.0);
    }

    pub fn add_weight(&mut self, contender: K, weight: f64, now: DateTime<Utc>) {
        self.decay(now);
        *self.contenders.entry(contender).or_insert(0.0) += weight;
    }

    /// The lightest contender satisfying `predicate`, ties going to the
    /// smaller key.
    pub fn take_winner_if(&mut self, mut predicate: impl FnMut(K) -> bool, now: DateTime<Utc>) -> Option<K> {
        self.decay(now);
        self.contenders
            .iter()
            .filter(|(contender, _)| predicate(**contender))
            .min_by(|(a_key, a), (b_key, b)| a.total_cmp(b).then_with(|| a_key.cmp(b_key)))
            .map(|(contender, _)| *contender)
    }

    pub fn weight(&self, contender: K) -> Option<f64> {
        self.contenders.get(&contender).copied()
    }

    pub fn reset_weights(&mut self) {
        for weight in self.contenders.values_mut() {
            *weight = 0.0;
        }
        self.last_decay = None;
    }

    fn decay(&mut self, now: DateTime<Utc>) {
        let Some(last) = self.last_decay else {
            self.last_decay = Some(now);
            return;
        };
        let elapsed = now - last;
        if elapsed <= Duration::zero() {
            return;
        }
        let half_life_ms = self.half_life.num_milliseconds();
        let factor = if half_life_ms > 0 {
            0.5f64.powf(elapsed.num_milliseconds() as f64 / half_life_ms as f64)
        } else {
            0.0
        };
        for weight in self.contenders.values_mut() {
            *weight *= factor;
        }
        self.last_decay = Some(now);
    }
}
