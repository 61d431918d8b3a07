//! Deterministic creator ordering.

use std::cmp::Ordering;

use crate::model::Creator;

/// Orders creators by estimated audience and narrows them for targeted runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntityOrderer;

impl EntityOrderer {
    /// Stable sort by paid audience descending, then free audience
    /// descending. Missing or non-numeric values count as zero.
    pub fn order(mut creators: Vec<Creator>) -> Vec<Creator> {
        creators.sort_by(Self::compare);
        creators
    }

    fn compare(a: &Creator, b: &Creator) -> Ordering {
        b.paid_audience()
            .partial_cmp(&a.paid_audience())
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                b.free_audience()
                    .partial_cmp(&a.free_audience())
                    .unwrap_or(Ordering::Equal)
            })
    }

    /// Keeps the creators whose `creator_id` (or `id`) equals `creator_id`.
    pub fn filter_by_id(creators: Vec<Creator>, creator_id: &str) -> Vec<Creator> {
        creators
            .into_iter()
            .filter(|c| c.matches(creator_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn creator(id: &str, paid: Option<Value>, free: Option<Value>) -> Creator {
        Creator {
            creator_id: Some(json!(id)),
            paid_subscribers_est: paid,
            free_subscribers_est: free,
            ..Default::default()
        }
    }

    fn ids(creators: &[Creator]) -> Vec<String> {
        creators.iter().filter_map(Creator::key).collect()
    }

    #[test]
    fn test_priority_then_secondary() {
        let ordered = EntityOrderer::order(vec![
            creator("a", Some(json!(5)), None),
            creator("b", None, None),
            creator("c", Some(json!(5)), Some(json!(10))),
        ]);
        assert_eq!(ids(&ordered), vec!["c", "a", "b"]);
    }

    #[test]
    fn test_ties_keep_input_order() {
        let ordered = EntityOrderer::order(vec![
            creator("x", Some(json!(1)), Some(json!(1))),
            creator("y", Some(json!("1")), Some(json!(1.0))),
            creator("z", Some(json!("n/a")), None),
            creator("w", None, Some(json!(null))),
        ]);
        assert_eq!(ids(&ordered), vec!["x", "y", "z", "w"]);
    }

    #[test]
    fn test_negative_zero_ties_with_absent() {
        let ordered = EntityOrderer::order(vec![
            creator("neg", Some(json!("-0")), None),
            creator("none", None, None),
            creator("zero", Some(json!(0)), Some(json!("-0.0"))),
        ]);
        assert_eq!(ids(&ordered), vec!["neg", "none", "zero"]);
    }

    #[test]
    fn test_filter_by_id_falls_back_to_id() {
        let mut by_row_id = Creator {
            id: Some(json!(42)),
            ..Default::default()
        };
        by_row_id.name = Some("row".into());
        let creators = vec![creator("a", None, None), by_row_id];

        assert_eq!(EntityOrderer::filter_by_id(creators.clone(), "a").len(), 1);
        let found = EntityOrderer::filter_by_id(creators.clone(), "42");
        assert_eq!(found[0].name.as_deref(), Some("row"));
        assert!(EntityOrderer::filter_by_id(creators, "missing").is_empty());
    }
}
