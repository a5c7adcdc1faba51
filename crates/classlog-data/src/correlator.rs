//! Cross-source correlation for classlog.
//!
//! Links events of different sources inside one [`Session`] into
//! [`Episode`]s: the execution an edit triggered, the edit burst a chat turn
//! preceded, the question a failed execution led to. Matching is a greedy,
//! windowed heuristic; an event without a partner is a normal outcome.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::TimeDelta;
use classlog_core::models::{Cardinality, Episode, Event, Relation, Session};
use classlog_core::settings::{AnalysisConfig, MatchPolicy};
use classlog_core::text::{line_distance, token_distance};
use tracing::debug;

// ── Candidates ────────────────────────────────────────────────────────────────

/// A possible (anchor, target) link, with positions into the session.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub anchor: usize,
    pub target: usize,
    /// `target.timestamp - anchor.timestamp`, never negative.
    pub gap: TimeDelta,
    /// Content dissimilarity in `[0, 1]`; `None` when either side has no
    /// content to compare.
    pub distance: Option<f64>,
}

/// Content dissimilarity between an anchor and a target of `relation`.
pub fn similarity_distance(relation: Relation, anchor: &Event, target: &Event) -> Option<f64> {
    match relation {
        Relation::TriggeredBy => Some(line_distance(anchor.content()?, target.content()?)),
        Relation::Preceded => Some(token_distance(anchor.content()?, target.content()?)),
        Relation::Consulted => {
            let execution = anchor.as_execution()?;
            let mut context = execution.code.clone();
            if let Some(error) = &execution.error {
                context.push('\n');
                context.push_str(&error.name);
                context.push(' ');
                context.push_str(&error.value);
            }
            Some(token_distance(&context, target.content()?))
        }
    }
}

// ── MatchStrategy ─────────────────────────────────────────────────────────────

/// Ranks competing candidates; the smallest candidate is claimed first.
///
/// Candidates a strategy considers equal are ordered by ingestion order of
/// the anchor, then of the target.
pub trait MatchStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering;
}

/// Known distances sort before unknown ones.
fn compare_distance(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Smallest time gap wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct NearestTimestamp;

impl MatchStrategy for NearestTimestamp {
    fn name(&self) -> &'static str {
        "nearest"
    }

    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        a.gap.cmp(&b.gap)
    }
}

/// Most similar content wins; the time gap breaks ties.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentSimilarity;

impl MatchStrategy for ContentSimilarity {
    fn name(&self) -> &'static str {
        "content"
    }

    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        compare_distance(a.distance, b.distance).then_with(|| a.gap.cmp(&b.gap))
    }
}

/// Smallest time gap wins; content similarity breaks ties.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hybrid;

impl MatchStrategy for Hybrid {
    fn name(&self) -> &'static str {
        "hybrid"
    }

    fn compare(&self, a: &Candidate, b: &Candidate) -> Ordering {
        a.gap
            .cmp(&b.gap)
            .then_with(|| compare_distance(a.distance, b.distance))
    }
}

pub fn strategy_for(policy: MatchPolicy) -> Box<dyn MatchStrategy> {
    match policy {
        MatchPolicy::Nearest => Box::new(NearestTimestamp),
        MatchPolicy::Content => Box::new(ContentSimilarity),
        MatchPolicy::Hybrid => Box::new(Hybrid),
    }
}

// ── Correlator ────────────────────────────────────────────────────────────────

/// Builds the episodes of a session for every relation with a configured
/// window.
pub struct Correlator {
    strategy: Box<dyn MatchStrategy>,
    windows: Vec<(Relation, TimeDelta)>,
}

impl Correlator {
    pub fn new(config: &AnalysisConfig) -> Self {
        Self::with_strategy(config, strategy_for(config.match_policy()))
    }

    pub fn with_strategy(config: &AnalysisConfig, strategy: Box<dyn MatchStrategy>) -> Self {
        Self {
            strategy,
            windows: config.relations().collect(),
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Episodes of every configured relation, grouped by relation and ordered
    /// by anchor position within each group.
    pub fn correlate(&self, session: &Session) -> Vec<Episode> {
        let episodes: Vec<Episode> = self
            .windows
            .iter()
            .flat_map(|(relation, window)| self.correlate_relation(session, *relation, *window))
            .collect();
        debug!(
            "Correlator[{}]: {} episodes in {}",
            self.strategy.name(),
            episodes.len(),
            session.id
        );
        episodes
    }

    /// Greedy matching for one relation.
    ///
    /// All candidate pairs inside the window are ranked once and claimed in
    /// rank order. A one-to-one relation claims both ends of a pair; a
    /// one-to-many relation claims only the target and gathers every target
    /// of an anchor into one episode. No event is claimed twice.
    pub fn correlate_relation(
        &self,
        session: &Session,
        relation: Relation,
        window: TimeDelta,
    ) -> Vec<Episode> {
        let events = &session.events;
        let mut candidates = Self::candidates(session, relation, window);
        candidates.sort_by(|a, b| {
            self.strategy
                .compare(a, b)
                .then_with(|| events[a.anchor].ingest_seq.cmp(&events[b.anchor].ingest_seq))
                .then_with(|| events[a.target].ingest_seq.cmp(&events[b.target].ingest_seq))
        });

        let mut anchor_claimed = vec![false; events.len()];
        let mut target_claimed = vec![false; events.len()];
        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();

        for candidate in candidates {
            if target_claimed[candidate.target] {
                continue;
            }
            if relation.cardinality() == Cardinality::OneToOne {
                if anchor_claimed[candidate.anchor] {
                    continue;
                }
                anchor_claimed[candidate.anchor] = true;
            }
            target_claimed[candidate.target] = true;
            groups.entry(candidate.anchor).or_default().push(candidate.target);
        }

        groups
            .into_iter()
            .map(|(anchor, mut targets)| {
                targets.sort_unstable();
                let mut members = Vec::with_capacity(targets.len() + 1);
                members.push(anchor);
                members.extend(targets);
                Episode { relation, members }
            })
            .collect()
    }

    fn candidates(session: &Session, relation: Relation, window: TimeDelta) -> Vec<Candidate> {
        let events = &session.events;
        let anchors: Vec<usize> = (0..events.len())
            .filter(|&i| relation.qualifies_anchor(&events[i]))
            .collect();
        let targets: Vec<usize> = (0..events.len())
            .filter(|&i| relation.qualifies_target(&events[i]))
            .collect();

        let mut candidates = Vec::new();
        for &anchor in &anchors {
            for &target in &targets {
                let gap = events[target].timestamp - events[anchor].timestamp;
                if gap < TimeDelta::zero() || gap > window {
                    continue;
                }
                candidates.push(Candidate {
                    anchor,
                    target,
                    gap,
                    distance: similarity_distance(relation, &events[anchor], &events[target]),
                });
            }
        }
        candidates
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
