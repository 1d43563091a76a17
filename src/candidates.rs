//! Candidate generation for the batch merge scan.
//!
//! Comparing every pair of records with the oracle is quadratic in oracle
//! calls. The generator runs cheap string heuristics over the canonical keys
//! and only forwards pairs that pass at least one of them:
//! - one key is a substring of the other
//! - token Jaccard similarity is at least `jaccard_threshold`
//! - character-bigram Dice coefficient is at least `dice_threshold`
//! - same first token and Jaccard at least `first_token_jaccard_threshold`
//!
//! The filter favors recall; the oracle is the precision filter.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::keyer::{canonical_key, split_key};
use crate::record::{NormalizedId, NormalizedRecord};
use crate::winner::winner_order;

/// Thresholds of the candidate heuristics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidateConfig {
    /// Minimum token-set Jaccard similarity.
    pub jaccard_threshold: f64,
    /// Minimum character-bigram Dice coefficient.
    pub dice_threshold: f64,
    /// Minimum Jaccard when both keys start with the same token.
    pub first_token_jaccard_threshold: f64,
    /// Maximum candidate losers examined per winner (bounds one oracle batch).
    pub max_losers_per_winner: usize,
}

impl Default for CandidateConfig {
    fn default() -> Self {
        Self {
            jaccard_threshold: 0.6,
            dice_threshold: 0.72,
            first_token_jaccard_threshold: 0.35,
            max_losers_per_winner: 20,
        }
    }
}

impl CandidateConfig {
    /// Validates thresholds.
    ///
    /// # Errors
    /// Returns `ValidationError::InvalidConfig` if a threshold is outside
    /// `[0, 1]` or the loser cap is zero.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (name, value) in [
            ("jaccard_threshold", self.jaccard_threshold),
            ("dice_threshold", self.dice_threshold),
            ("first_token_jaccard_threshold", self.first_token_jaccard_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ValidationError::InvalidConfig {
                    reason: format!("{name} must be in [0, 1] (got {value})"),
                });
            }
        }
        if self.max_losers_per_winner == 0 {
            return Err(ValidationError::InvalidConfig {
                reason: "max_losers_per_winner must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Token-set Jaccard similarity of two underscore-separated keys.
#[must_use]
pub fn token_jaccard(a: &str, b: &str) -> f64 {
    let ta: HashSet<&str> = split_key(a).collect();
    let tb: HashSet<&str> = split_key(b).collect();
    jaccard_sets(&ta, &tb)
}

fn jaccard_sets(ta: &HashSet<&str>, tb: &HashSet<&str>) -> f64 {
    if ta.is_empty() && tb.is_empty() {
        return 0.0;
    }
    let inter = ta.intersection(tb).count();
    let union = ta.len() + tb.len() - inter;
    #[allow(clippy::cast_precision_loss)]
    let sim = inter as f64 / union as f64;
    sim
}

fn bigrams(s: &str) -> HashMap<(char, char), usize> {
    let chars: Vec<char> = s.chars().collect();
    let mut out = HashMap::new();
    for pair in chars.windows(2) {
        *out.entry((pair[0], pair[1])).or_insert(0) += 1;
    }
    out
}

fn dice_maps(a: &HashMap<(char, char), usize>, b: &HashMap<(char, char), usize>) -> f64 {
    let total: usize = a.values().sum::<usize>() + b.values().sum::<usize>();
    if total == 0 {
        return 0.0;
    }
    let shared: usize = a
        .iter()
        .map(|(bg, &n)| b.get(bg).map_or(0, |&m| n.min(m)))
        .sum();
    #[allow(clippy::cast_precision_loss)]
    let sim = (2 * shared) as f64 / total as f64;
    sim
}

/// Character-bigram Dice coefficient (multiset) of two strings.
///
/// # Examples
///
/// ```
/// use kyronorm::candidates::bigram_dice;
///
/// assert_eq!(bigram_dice("night", "nacht"), 0.25);
/// assert_eq!(bigram_dice("sabor", "sabor"), 1.0);
/// ```
#[must_use]
pub fn bigram_dice(a: &str, b: &str) -> f64 {
    dice_maps(&bigrams(a), &bigrams(b))
}

/// Which heuristic flagged a pair. Kept as evidence in dry-run output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateReason {
    Substring,
    Jaccard,
    Dice,
    FirstToken,
}

/// A winner and the losers worth asking the oracle about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateBatch {
    pub winner: NormalizedId,
    pub losers: Vec<NormalizedId>,
}

struct Prepared<'a> {
    record: &'a NormalizedRecord,
    tokens: HashSet<&'a str>,
    first: Option<&'a str>,
    bigrams: HashMap<(char, char), usize>,
    buckets: BTreeSet<String>,
}

/// Buckets a record falls in: the keyed form of its canonical key and of its
/// display name.
#[must_use]
pub fn record_buckets(record: &NormalizedRecord) -> BTreeSet<String> {
    [
        canonical_key(&record.canonical_key),
        canonical_key(&record.display_name),
    ]
    .into_iter()
    .filter(|k| !k.is_empty())
    .collect()
}

/// Heuristic pair filter over a catalog snapshot.
#[derive(Debug, Clone, Default)]
pub struct CandidateGenerator {
    config: CandidateConfig,
}

impl CandidateGenerator {
    /// Creates a generator with the given thresholds.
    #[must_use]
    pub const fn new(config: CandidateConfig) -> Self {
        Self { config }
    }

    /// Returns the thresholds in use.
    #[must_use]
    pub const fn config(&self) -> &CandidateConfig {
        &self.config
    }

    /// Returns the first heuristic that flags the pair, if any.
    #[must_use]
    pub fn check_pair(&self, a: &str, b: &str) -> Option<CandidateReason> {
        if a.is_empty() || b.is_empty() || a == b {
            return None;
        }
        let ta: HashSet<&str> = split_key(a).collect();
        let tb: HashSet<&str> = split_key(b).collect();
        self.check_prepared(
            a,
            b,
            &ta,
            &tb,
            split_key(a).next(),
            split_key(b).next(),
            &bigrams(a),
            &bigrams(b),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn check_prepared(
        &self,
        a: &str,
        b: &str,
        ta: &HashSet<&str>,
        tb: &HashSet<&str>,
        first_a: Option<&str>,
        first_b: Option<&str>,
        ba: &HashMap<(char, char), usize>,
        bb: &HashMap<(char, char), usize>,
    ) -> Option<CandidateReason> {
        if a.contains(b) || b.contains(a) {
            return Some(CandidateReason::Substring);
        }
        let jaccard = jaccard_sets(ta, tb);
        if jaccard >= self.config.jaccard_threshold {
            return Some(CandidateReason::Jaccard);
        }
        if dice_maps(ba, bb) >= self.config.dice_threshold {
            return Some(CandidateReason::Dice);
        }
        if first_a.is_some()
            && first_a == first_b
            && jaccard >= self.config.first_token_jaccard_threshold
        {
            return Some(CandidateReason::FirstToken);
        }
        None
    }

    /// Generates candidate batches over active records.
    ///
    /// Records are walked in winner order; each record is the batch winner
    /// for the records ranked after it. Pairs with identical keys or a shared
    /// bucket are skipped: the scan merges those without asking the oracle.
    #[must_use]
    pub fn generate(&self, records: &[NormalizedRecord]) -> Vec<CandidateBatch> {
        let mut active: Vec<&NormalizedRecord> = records.iter().filter(|r| r.is_active).collect();
        active.sort_by(|a, b| winner_order(a, b));

        let prepared: Vec<Prepared<'_>> = active
            .iter()
            .map(|&r| Prepared {
                record: r,
                tokens: split_key(&r.canonical_key).collect(),
                first: split_key(&r.canonical_key).next(),
                bigrams: bigrams(&r.canonical_key),
                buckets: record_buckets(r),
            })
            .collect();

        let cap = self.config.max_losers_per_winner;
        let mut out = Vec::new();
        for (i, w) in prepared.iter().enumerate() {
            let mut losers = Vec::new();
            for l in &prepared[i + 1..] {
                if losers.len() >= cap {
                    break;
                }
                let (wk, lk) = (&w.record.canonical_key, &l.record.canonical_key);
                if wk.is_empty() || lk.is_empty() || wk == lk {
                    continue;
                }
                if !w.buckets.is_disjoint(&l.buckets) {
                    continue;
                }
                let hit = self.check_prepared(
                    wk, lk, &w.tokens, &l.tokens, w.first, l.first, &w.bigrams, &l.bigrams,
                );
                if hit.is_some() {
                    losers.push(l.record.id);
                }
            }
            if !losers.is_empty() {
                out.push(CandidateBatch {
                    winner: w.record.id,
                    losers,
                });
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confidence::Confidence;
    use crate::record::{CreatedBy, NewRecord, NormalizedKind};

    fn record(key: &str, usage: u64) -> NormalizedRecord {
        let mut r = NormalizedRecord::from_new(
            NormalizedKind::Entity,
            NewRecord {
                canonical_key: key.to_string(),
                display_name: key.replace('_', " "),
                description: String::new(),
                examples: Vec::new(),
                confidence: Confidence::clamped(0.8),
                created_by: CreatedBy::Ai,
            },
        );
        r.usage_count = usage;
        r
    }

    #[test]
    fn test_token_jaccard() {
        assert!((token_jaccard("a_b", "a_b") - 1.0).abs() < 1e-9);
        assert!((token_jaccard("a_b", "a_c") - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(token_jaccard("", ""), 0.0);
    }

    #[test]
    fn test_bigram_dice() {
        assert!((bigram_dice("night", "nacht") - 0.25).abs() < 1e-9);
        assert_eq!(bigram_dice("a", "b"), 0.0);
        assert!(bigram_dice("camarero", "camarera") > 0.8);
    }

    #[test]
    fn test_check_pair_reasons() {
        let generator = CandidateGenerator::default();
        assert_eq!(
            generator.check_pair("helado", "helado_chocolate"),
            Some(CandidateReason::Substring)
        );
        assert_eq!(
            generator.check_pair("calidad_precio_menu", "precio_menu_calidad_buena"),
            Some(CandidateReason::Jaccard)
        );
        assert_eq!(
            generator.check_pair("camarero", "camarera"),
            Some(CandidateReason::Dice)
        );
        assert_eq!(
            generator.check_pair("servicio_mesa_rapido", "servicio_mesa_lento_terraza"),
            Some(CandidateReason::FirstToken)
        );
        assert_eq!(generator.check_pair("helado", "aparcamiento"), None);
        assert_eq!(generator.check_pair("helado", "helado"), None);
    }

    #[test]
    fn test_generate_orders_by_winner_and_skips_buckets() {
        let a = record("camarero", 10);
        let b = record("camarera", 3);
        let c = record("aparcamiento", 7);
        let d = record("camareros", 1);
        let generator = CandidateGenerator::default();
        let batches = generator.generate(&[b.clone(), c.clone(), a.clone(), d.clone()]);

        let a_batch = batches.iter().find(|x| x.winner == a.id).unwrap();
        // "camareros" shares the "camarero" bucket and is left to bucket merging.
        assert_eq!(a_batch.losers, vec![b.id]);
        assert!(batches.iter().all(|x| x.winner != c.id && !x.losers.contains(&c.id)));
        assert!(batches.iter().all(|x| x.winner != d.id));
    }

    #[test]
    fn test_generate_caps_losers_and_ignores_inactive() {
        let winner = record("servicio", 100);
        let mut records = vec![winner.clone()];
        for i in 0..30 {
            records.push(record(&format!("servicio_{i}x"), 1));
        }
        let mut inactive = record("servicio_rapido", 50);
        inactive.is_active = false;
        records.push(inactive.clone());

        let generator = CandidateGenerator::new(CandidateConfig {
            max_losers_per_winner: 5,
            ..CandidateConfig::default()
        });
        let batches = generator.generate(&records);
        let first = batches.iter().find(|b| b.winner == winner.id).unwrap();
        assert_eq!(first.losers.len(), 5);
        assert!(batches
            .iter()
            .all(|b| b.winner != inactive.id && !b.losers.contains(&inactive.id)));
    }

    #[test]
    fn test_config_validate() {
        assert!(CandidateConfig::default().validate().is_ok());
        let bad = CandidateConfig {
            dice_threshold: 1.5,
            ..CandidateConfig::default()
        };
        assert!(bad.validate().is_err());
        let bad = CandidateConfig {
            max_losers_per_winner: 0,
            ..CandidateConfig::default()
        };
        assert!(bad.validate().is_err());
    }
}
