//! Records that ship inside the binary. The last rung of the cascade, so a
//! learner always has something to practise.

use serde_json::json;

use crate::models::Record;

/// Chunk id under which baseline keys are indexed.
pub const BASELINE_CHUNK_ID: &str = "baseline";

/// (lemma, gloss)
const ESSENTIAL_VERBS: &[(&str, &str)] = &[
    ("ser", "to be (essential)"),
    ("estar", "to be (state, location)"),
    ("tener", "to have"),
    ("haber", "to have (auxiliary)"),
    ("ir", "to go"),
    ("hacer", "to do, to make"),
    ("poder", "to be able to"),
    ("decir", "to say"),
    ("ver", "to see"),
    ("dar", "to give"),
    ("saber", "to know (facts)"),
    ("querer", "to want"),
];

pub fn baseline_keys() -> impl Iterator<Item = &'static str> {
    ESSENTIAL_VERBS.iter().map(|(lemma, _)| *lemma)
}

pub fn baseline_records() -> Vec<Record> {
    ESSENTIAL_VERBS
        .iter()
        .map(|(lemma, gloss)| {
            Record::new(
                *lemma,
                json!({
                    "lemma": lemma,
                    "gloss": gloss,
                    "baseline": true,
                }),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_baseline_is_non_empty_and_unique() {
        let records = baseline_records();
        assert!(!records.is_empty());
        let mut keys: Vec<&str> = baseline_keys().collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), records.len());
    }
}
