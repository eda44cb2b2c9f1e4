//! Tier-1: deterministic keyword/heuristic relevance filter. Makes no
//! collaborator calls.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, instrument};

use curator_shared::{CuratorError, Item, Result, Tier, Tier1Config};

/// Compiled Tier-1 rules.
pub struct Tier1Filter {
    min_text_len: usize,
    categories: Vec<(String, Vec<Regex>)>,
    disabled_sources: HashSet<String>,
}

/// Survivors plus the reasons everything else was dropped.
#[derive(Debug, Clone, Default)]
pub struct Tier1Outcome {
    pub passed: Vec<Item>,
    pub dropped_disabled: usize,
    pub dropped_short: usize,
    pub dropped_unmatched: usize,
}

impl Tier1Outcome {
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        BTreeMap::from([
            ("dropped_disabled".to_string(), self.dropped_disabled as f64),
            ("dropped_short".to_string(), self.dropped_short as f64),
            ("dropped_unmatched".to_string(), self.dropped_unmatched as f64),
        ])
    }
}

impl Tier1Filter {
    pub fn new(config: &Tier1Config) -> Result<Self> {
        let mut categories = Vec::with_capacity(config.categories.len());
        for rule in &config.categories {
            let patterns = rule
                .keywords
                .iter()
                .filter(|k| !k.trim().is_empty())
                .map(|k| {
                    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(k.trim()))).map_err(|e| {
                        CuratorError::phase(
                            "tier1_filter",
                            format!("bad keyword '{k}' in category {}: {e}", rule.name),
                        )
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            categories.push((rule.name.clone(), patterns));
        }

        Ok(Self {
            min_text_len: config.min_text_len,
            categories,
            disabled_sources: config.disabled_sources.iter().cloned().collect(),
        })
    }

    /// First category (in configured order) with a keyword in title or body.
    pub fn categorize(&self, item: &Item) -> Option<&str> {
        let text = item.text();
        self.categories
            .iter()
            .find(|(_, patterns)| patterns.iter().any(|p| p.is_match(&text)))
            .map(|(name, _)| name.as_str())
    }

    /// Filter `items`, tagging each survivor with its matched category.
    /// Output order follows input order.
    #[instrument(skip_all, fields(input = items.len()))]
    pub fn apply(&self, items: Vec<Item>, at: DateTime<Utc>) -> Tier1Outcome {
        let mut outcome = Tier1Outcome::default();

        for mut item in items {
            if self.disabled_sources.contains(&item.source_id) {
                outcome.dropped_disabled += 1;
                continue;
            }
            let len = item.title.trim().chars().count() + item.body.trim().chars().count();
            if len < self.min_text_len {
                outcome.dropped_short += 1;
                continue;
            }
            let Some(category) = self.categorize(&item).map(str::to_string) else {
                outcome.dropped_unmatched += 1;
                continue;
            };

            if !item.tags.contains(&category) {
                item.tags.push(category.clone());
            }
            item.category = Some(category);
            item.admit(Tier::Tier1, None, at);
            outcome.passed.push(item);
        }

        debug!(
            passed = outcome.passed.len(),
            dropped_short = outcome.dropped_short,
            dropped_unmatched = outcome.dropped_unmatched,
            "tier-1 filter applied"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curator_shared::{CategoryRule, RawItem};

    fn item(source: &str, title: &str, body: &str) -> Item {
        Item::from_raw(
            RawItem {
                source_id: source.into(),
                title: title.into(),
                url: Some(format!("https://example.com/{}", title.replace(' ', "-"))),
                body: body.into(),
                published_at: None,
            },
            1.0,
            collected_at(),
        )
    }

    fn collected_at() -> DateTime<Utc> {
        "2026-10-19T08:00:00Z".parse().unwrap()
    }

    fn sample() -> Vec<Item> {
        vec![
            item("wire", "Acme launches a new robot vacuum", "Available in stores next month."),
            item("wire", "Local bakery opens", "Bread."),
            item("wire", "City council meeting notes", "The council discussed parking rules downtown."),
            item("wire", "Startup raises Series A for logistics", "Funding led by a large firm."),
            item("blocked", "Beta launches an agent framework", "A framework for building agents."),
            item("wire", "Said the chair", "Nothing about artificial intelligence was said today."),
        ]
    }

    #[test]
    fn filters_and_tags() {
        let filter = Tier1Filter::new(&Tier1Config {
            disabled_sources: vec!["blocked".into()],
            ..Tier1Config::default()
        })
        .unwrap();
        let outcome = filter.apply(sample(), Utc::now());

        let titles: Vec<_> = outcome.passed.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(
            titles,
            vec!["Acme launches a new robot vacuum", "Startup raises Series A for logistics"]
        );
        assert_eq!(outcome.passed[0].category.as_deref(), Some("product_launch"));
        assert_eq!(outcome.passed[1].category.as_deref(), Some("funding"));
        assert_eq!(outcome.passed[0].tier_score(Tier::Tier1), None);
        assert_eq!(outcome.passed[0].admissions.len(), 1);
        assert_eq!(outcome.dropped_disabled, 1);
        assert_eq!(outcome.dropped_short, 1);
        // "said" must not match the "ai" keyword.
        assert_eq!(outcome.dropped_unmatched, 2);
    }

    #[test]
    fn deterministic() {
        let filter = Tier1Filter::new(&Tier1Config::default()).unwrap();
        let at = collected_at();
        let input = sample();
        assert_eq!(input, sample());
        let a = filter.apply(input.clone(), at);
        let b = filter.apply(input, at);
        assert_eq!(a.passed, b.passed);
        assert_eq!(a.passed.len(), 2);
    }

    #[test]
    fn first_category_wins() {
        let filter = Tier1Filter::new(&Tier1Config {
            min_text_len: 0,
            categories: vec![
                CategoryRule {
                    name: "first".into(),
                    keywords: vec!["widget".into()],
                },
                CategoryRule {
                    name: "second".into(),
                    keywords: vec!["widget".into(), "gadget".into()],
                },
            ],
            disabled_sources: vec![],
        })
        .unwrap();
        let outcome = filter.apply(vec![item("s", "Widget and gadget", "")], Utc::now());
        assert_eq!(outcome.passed[0].category.as_deref(), Some("first"));
        assert_eq!(outcome.passed[0].tags, vec!["first".to_string()]);
    }
}
