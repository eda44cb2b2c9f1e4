//! Weekly deduplication and ranking.
//!
//! Exact duplicates share an item id. Near duplicates share a normalized URL
//! or have highly similar titles; they are grouped transitively and each group
//! keeps one representative. Survivors are ranked by Tier-2 quality and
//! recency with a per-source diversity penalty.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use curator_shared::{Item, RankingConfig, Tier, normalize_url};

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "in", "is", "it", "its",
    "new", "of", "on", "or", "that", "the", "to", "with",
];

#[derive(Debug, Default)]
pub struct RankOutcome {
    /// Top-k candidates, best first.
    pub candidates: Vec<Item>,
    /// Distinct items after exact deduplication.
    pub unique: usize,
    pub exact_duplicates: usize,
    pub near_duplicates: usize,
}

impl RankOutcome {
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("unique".to_string(), self.unique as f64),
            ("exact_duplicates".to_string(), self.exact_duplicates as f64),
            ("near_duplicates".to_string(), self.near_duplicates as f64),
        ])
    }
}

fn tier2_score(item: &Item) -> f64 {
    item.tier_score(Tier::Tier2).unwrap_or(0.0)
}

/// Prefer the higher Tier-2 score, then the earlier collection time, then the smaller id.
fn better(a: &Item, b: &Item) -> bool {
    match tier2_score(a).partial_cmp(&tier2_score(b)).unwrap_or(Ordering::Equal) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => (a.collected_at, &a.id) < (b.collected_at, &b.id),
    }
}

/// Lowercased significant words of a title.
fn title_tokens(title: &str) -> HashSet<String> {
    title
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .filter(|w| !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    shared as f64 / (a.len() + b.len() - shared) as f64
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[ra.max(rb)] = ra.min(rb);
        }
    }
}

/// Collapse exact duplicates (same id), keeping the best copy.
fn dedup_exact(items: Vec<Item>) -> (Vec<Item>, usize) {
    let total = items.len();
    let mut order: Vec<Item> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for item in items {
        match index.get(item.id.as_str()) {
            Some(&i) => {
                if better(&item, &order[i]) {
                    order[i] = item;
                }
            }
            None => {
                index.insert(item.id.as_str().to_string(), order.len());
                order.push(item);
            }
        }
    }
    let dupes = total - order.len();
    (order, dupes)
}

/// Collapse near duplicates, keeping the best member of each group.
fn dedup_near(items: Vec<Item>, threshold: f64) -> (Vec<Item>, usize) {
    let n = items.len();
    let urls: Vec<Option<String>> = items
        .iter()
        .map(|i| i.url.as_deref().and_then(normalize_url))
        .collect();
    let tokens: Vec<HashSet<String>> = items.iter().map(|i| title_tokens(&i.title)).collect();

    let mut sets = DisjointSet::new(n);
    for a in 0..n {
        for b in (a + 1)..n {
            let same_url = matches!((&urls[a], &urls[b]), (Some(x), Some(y)) if x == y);
            if same_url || jaccard(&tokens[a], &tokens[b]) >= threshold {
                sets.union(a, b);
            }
        }
    }

    let mut best: BTreeMap<usize, usize> = BTreeMap::new();
    for i in 0..n {
        let root = sets.find(i);
        if best
            .get(&root)
            .is_none_or(|&current| better(&items[i], &items[current]))
        {
            best.insert(root, i);
        }
    }

    let keep: HashSet<usize> = best.values().copied().collect();
    let kept: Vec<Item> = items
        .into_iter()
        .enumerate()
        .filter(|(i, _)| keep.contains(i))
        .map(|(_, item)| item)
        .collect();
    let dupes = n - kept.len();
    (kept, dupes)
}

/// Quality-plus-recency score before the diversity penalty.
fn base_score(item: &Item, config: &RankingConfig, lookback_days: u32, now: DateTime<Utc>) -> f64 {
    let quality = tier2_score(item) / 10.0;
    let at = item.published_at.unwrap_or(item.collected_at);
    let age_days = (now - at).num_seconds() as f64 / 86_400.0;
    let window = f64::from(lookback_days.max(1));
    let recency = (1.0 - age_days / window).clamp(0.0, 1.0);
    config.quality_weight * quality + config.recency_weight * recency
}

/// Deduplicate the accumulated week and return the top `config.top_k`
/// candidates. Deterministic for a given input and `now`.
#[instrument(skip_all, fields(items = items.len(), top_k = config.top_k))]
pub fn dedup_and_rank(
    items: Vec<Item>,
    config: &RankingConfig,
    lookback_days: u32,
    now: DateTime<Utc>,
) -> RankOutcome {
    let (unique, exact_duplicates) = dedup_exact(items);
    let unique_count = unique.len();
    let (distinct, near_duplicates) = dedup_near(unique, config.near_duplicate_threshold);

    let mut pool: Vec<(f64, Item)> = distinct
        .into_iter()
        .map(|item| (base_score(&item, config, lookback_days, now), item))
        .collect();

    // Greedy selection: each pick penalizes the remaining items from its source.
    let mut per_source: HashMap<String, usize> = HashMap::new();
    let mut candidates = Vec::with_capacity(config.top_k.min(pool.len()));
    while candidates.len() < config.top_k && !pool.is_empty() {
        let adjusted = |(score, item): &(f64, Item)| {
            score - config.diversity_penalty * per_source.get(&item.source_id).copied().unwrap_or(0) as f64
        };
        let mut best = 0;
        for i in 1..pool.len() {
            let (a, b) = (adjusted(&pool[i]), adjusted(&pool[best]));
            let wins = match a.partial_cmp(&b).unwrap_or(Ordering::Equal) {
                Ordering::Greater => true,
                Ordering::Less => false,
                Ordering::Equal => pool[i].1.id < pool[best].1.id,
            };
            if wins {
                best = i;
            }
        }
        let (_, item) = pool.swap_remove(best);
        *per_source.entry(item.source_id.clone()).or_default() += 1;
        candidates.push(item);
    }

    debug!(
        unique = unique_count,
        exact_duplicates,
        near_duplicates,
        candidates = candidates.len(),
        "week deduplicated and ranked"
    );

    RankOutcome {
        candidates,
        unique: unique_count,
        exact_duplicates,
        near_duplicates,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use curator_shared::RawItem;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-10-23T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn item(source: &str, title: &str, url: &str, t2: f64, days_ago: i64) -> Item {
        let at = now() - Duration::days(days_ago);
        let mut item = Item::from_raw(
            RawItem {
                source_id: source.into(),
                title: title.into(),
                url: Some(url.into()),
                body: String::new(),
                published_at: Some(at),
            },
            1.0,
            at,
        );
        item.admit(Tier::Tier2, Some(t2), at);
        item
    }

    #[test]
    fn exact_duplicates_keep_highest_tier2_score() {
        let items = vec![
            item("a", "Acme ships robot", "https://a.example.com/1", 6.0, 1),
            item("a", "Acme ships robot", "https://a.example.com/1?utm_source=feed", 9.0, 0),
            item("b", "Unrelated funding round", "https://b.example.com/2", 7.0, 1),
        ];
        let outcome = dedup_and_rank(items, &RankingConfig::default(), 7, now());
        assert_eq!(outcome.unique, 2);
        assert_eq!(outcome.exact_duplicates, 1);
        let acme = outcome
            .candidates
            .iter()
            .find(|i| i.title == "Acme ships robot")
            .unwrap();
        assert_eq!(acme.tier_score(Tier::Tier2), Some(9.0));
    }

    #[test]
    fn near_duplicate_titles_collapse_transitively() {
        let items = vec![
            item("a", "Acme launches Orion toolkit for agents", "https://a.example.com/x", 7.0, 1),
            item("b", "Acme launches the Orion toolkit for agents", "https://b.example.com/y", 8.0, 1),
            item("c", "Acme launches Orion toolkit for agents today", "https://c.example.com/z", 6.0, 1),
            item("d", "Beta raises Series B", "https://d.example.com/w", 6.0, 1),
        ];
        let outcome = dedup_and_rank(items, &RankingConfig::default(), 7, now());
        assert_eq!(outcome.unique, 4);
        assert_eq!(outcome.near_duplicates, 2);
        assert_eq!(outcome.candidates.len(), 2);
        assert_eq!(outcome.candidates[0].source_id, "b");
    }

    #[test]
    fn jaccard_ignores_stop_words_and_case() {
        let a = title_tokens("The Orion Toolkit");
        let b = title_tokens("orion toolkit");
        assert_eq!(jaccard(&a, &b), 1.0);
        assert_eq!(jaccard(&a, &HashSet::new()), 0.0);
    }

    #[test]
    fn recency_breaks_equal_quality() {
        let items = vec![
            item("a", "Older story about chips", "https://a.example.com/old", 8.0, 5),
            item("b", "Fresh story about models", "https://b.example.com/new", 8.0, 0),
        ];
        let outcome = dedup_and_rank(items, &RankingConfig::default(), 7, now());
        assert_eq!(outcome.candidates[0].title, "Fresh story about models");
    }

    #[test]
    fn diversity_penalty_interleaves_sources() {
        let items = vec![
            item("a", "First alpha piece", "https://a.example.com/1", 8.0, 0),
            item("a", "Second alpha story", "https://a.example.com/2", 8.0, 0),
            item("b", "Beta update", "https://b.example.com/1", 7.5, 0),
        ];
        let config = RankingConfig {
            top_k: 3,
            diversity_penalty: 0.1,
            ..RankingConfig::default()
        };
        let outcome = dedup_and_rank(items, &config, 7, now());
        let sources: Vec<_> = outcome.candidates.iter().map(|i| i.source_id.as_str()).collect();
        assert_eq!(sources, vec!["a", "b", "a"]);
    }

    #[test]
    fn top_k_caps_output_and_is_deterministic() {
        let items: Vec<_> = (0..30)
            .map(|i| {
                item(
                    &format!("s{}", i % 4),
                    &format!("Story {i} about topic{i}"),
                    &format!("https://s.example.com/{i}"),
                    f64::from(i % 10),
                    i64::from(i % 7),
                )
            })
            .collect();
        let config = RankingConfig {
            top_k: 10,
            ..RankingConfig::default()
        };
        let a = dedup_and_rank(items.clone(), &config, 7, now());
        let b = dedup_and_rank(items, &config, 7, now());
        assert_eq!(a.candidates.len(), 10);
        let ids = |o: &RankOutcome| o.candidates.iter().map(|i| i.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&a), ids(&b));
    }
}
