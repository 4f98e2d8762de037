use std::{
    cmp::Ordering,
    collections::{btree_map::Entry, BTreeMap},
};

use genmix_client::domain::GenerationRecord;

/// Which record survives when two share a key and an ingestion version.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Later position in the input wins.
    #[default]
    LastSeen,
    /// Earlier position in the input wins.
    FirstSeen,
}

/// Collapse records sharing `(ts, fuel_type)` to the one with the highest
/// `ingestion_version`. Output is ordered by key.
pub fn dedupe(records: Vec<GenerationRecord>, tie_break: TieBreak) -> Vec<GenerationRecord> {
    let mut survivors = BTreeMap::new();

    for record in records {
        match survivors.entry(record.key()) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                let replace = match record.ingestion_version.cmp(&slot.get().ingestion_version) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => tie_break == TieBreak::LastSeen,
                };
                if replace {
                    slot.insert(record);
                }
            }
        }
    }

    survivors.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use genmix_client::domain::FuelType;
    use time::{macros::datetime, OffsetDateTime};

    fn record(ts: OffsetDateTime, fuel: FuelType, mw: f64, version: i64) -> GenerationRecord {
        GenerationRecord {
            ts,
            fuel_type: fuel,
            generation_mw: mw,
            mix_percentage: 50.0,
            ingestion_version: version,
            record_id: Some(42),
            quality_suspect: false,
        }
    }

    fn permutations(items: &[GenerationRecord]) -> Vec<Vec<GenerationRecord>> {
        if items.len() <= 1 {
            return vec![items.to_vec()];
        }
        let mut out = Vec::new();
        for i in 0..items.len() {
            let mut rest = items.to_vec();
            let head = rest.remove(i);
            for mut tail in permutations(&rest) {
                tail.insert(0, head.clone());
                out.push(tail);
            }
        }
        out
    }

    #[test]
    fn highest_version_survives_any_permutation() {
        let ts = datetime!(2025-01-01 00:00 UTC);
        let inputs = vec![
            record(ts, FuelType::Gas, 10.0, 1),
            record(ts, FuelType::Gas, 30.0, 3),
            record(ts, FuelType::Gas, 20.0, 2),
            record(ts, FuelType::Wind, 5.0, 1),
        ];

        let expected = vec![record(ts, FuelType::Gas, 30.0, 3), record(ts, FuelType::Wind, 5.0, 1)];
        for perm in permutations(&inputs) {
            assert_eq!(dedupe(perm, TieBreak::LastSeen), expected);
        }
    }

    #[test]
    fn equal_versions_follow_the_tie_break() {
        let ts = datetime!(2025-01-01 00:30 UTC);
        let first = record(ts, FuelType::Solar, 1.0, 7);
        let second = record(ts, FuelType::Solar, 2.0, 7);

        let last = dedupe(vec![first.clone(), second.clone()], TieBreak::LastSeen);
        assert_eq!(last, vec![second.clone()]);

        let earliest = dedupe(vec![first.clone(), second], TieBreak::FirstSeen);
        assert_eq!(earliest, vec![first]);
    }

    #[test]
    fn output_is_sorted_by_key() {
        let late = datetime!(2025-01-01 01:00 UTC);
        let early = datetime!(2025-01-01 00:00 UTC);
        let out = dedupe(
            vec![
                record(late, FuelType::Coal, 1.0, 1),
                record(early, FuelType::Wind, 1.0, 1),
                record(early, FuelType::Coal, 1.0, 1),
            ],
            TieBreak::LastSeen,
        );

        let keys: Vec<_> = out.iter().map(|r| r.key()).collect();
        assert_eq!(
            keys,
            vec![(early, FuelType::Coal), (early, FuelType::Wind), (late, FuelType::Coal)]
        );
    }
}
