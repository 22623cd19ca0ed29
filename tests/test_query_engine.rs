//! Integration tests for filtered queries and occurrence drill-down
//!
//! Key properties tested:
//! - Filter terms combine with AND (result = intersection of single terms)
//! - SQL pushdown and streaming scan agree on every filter
//! - Pagination is deterministic and covers the filtered set exactly once
//! - Occurrence counts per rule add up to the rule's counters

#[cfg(test)]
mod query_engine_tests {
    use snapshot_validation_stats::validation_core::{OccurrenceValues, RecordOutcome};
    use snapshot_validation_stats::{ErrorClass, StaticNetworkResolver, StatsConfig, ValidationStatsService};
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;
    use tempfile::{tempdir, TempDir};

    const RULES: [i64; 3] = [10, 11, 12];
    const NO_FILTERS: &[&str] = &[];
    const LANGUAGES: [&str; 4] = ["en", "es", "pt", "xx"];

    /// 40 records with a deterministic mix of outcomes; rule 12 carries a
    /// language occurrence per record
    fn outcome(n: usize) -> RecordOutcome {
        let r10 = n % 2 == 0;
        let r11 = n % 3 != 0;
        let language = LANGUAGES[n % LANGUAGES.len()];
        let r12 = language != "xx";

        let values = if r12 {
            OccurrenceValues { valid_values: vec![language.to_string()], invalid_values: vec![] }
        } else {
            OccurrenceValues { valid_values: vec![], invalid_values: vec![language.to_string()] }
        };

        RecordOutcome {
            identifier: format!("oai:{}:{:03}", if n % 5 == 0 { "alpha" } else { "beta" }, n),
            identifier_hash: format!("{:08x}", n * 2_654_435_761 % 4_294_967_291),
            datestamp: None,
            is_valid: r10 && r11 && r12,
            is_transformed: n % 4 == 1,
            published_metadata_hash: None,
            rule_results: BTreeMap::from([(10, r10), (11, r11), (12, r12)]),
            occurrences: BTreeMap::from([(12, values)]),
        }
    }

    fn seeded_service() -> (TempDir, ValidationStatsService) {
        let dir = tempdir().unwrap();
        let service = ValidationStatsService::new(
            StatsConfig::new(dir.path())
                .with_batch_size(7)
                .with_cursor_page_size(6)
                .with_detailed_diagnose(true),
            Arc::new(StaticNetworkResolver::with_default("br")),
        );

        service.initialize_validation_for_snapshot(5, &RULES).unwrap();
        for n in 0..40 {
            service.add_observation(5, &outcome(n)).unwrap();
        }
        service.finalize_validation_for_snapshot(5).unwrap();
        (dir, service)
    }

    fn listed_identifiers(service: &ValidationStatsService, filters: &[&str]) -> BTreeSet<String> {
        service
            .query_paginated(5, filters, 0, 1000)
            .unwrap()
            .items
            .into_iter()
            .map(|o| o.identifier)
            .collect()
    }

    #[test]
    fn test_filter_is_valid_returns_matching_records() {
        let (_dir, service) = seeded_service();

        let expected: BTreeSet<String> = (0..40).map(outcome).filter(|o| o.is_valid).map(|o| o.identifier).collect();
        assert!(!expected.is_empty());
        assert_eq!(listed_identifiers(&service, &["is_valid:true"]), expected);

        let stats = service.query_aggregated_stats(5, &["record_is_valid@@true"]).unwrap();
        assert_eq!(stats.total_records as usize, expected.len());
        assert_eq!(stats.valid_records, stats.total_records);
    }

    #[test]
    fn test_and_equals_intersection() {
        let (_dir, service) = seeded_service();

        let pairs: [(&str, &str); 4] = [
            ("valid_rules:10", "invalid_rules:11"),
            ("identifier:alpha", "is_valid:false"),
            ("is_transformed:true", "valid_rules:12"),
            ("invalid_rules:12", "identifier@@beta"),
        ];
        for (f1, f2) in pairs {
            let both = listed_identifiers(&service, &[f1, f2]);
            let first = listed_identifiers(&service, &[f1]);
            let second = listed_identifiers(&service, &[f2]);
            let intersection: BTreeSet<String> = first.intersection(&second).cloned().collect();
            assert_eq!(both, intersection, "{} AND {}", f1, f2);
        }
    }

    #[test]
    fn test_pushdown_equals_scan() {
        let (_dir, service) = seeded_service();

        let filters: [&[&str]; 6] = [
            NO_FILTERS,
            &["is_valid:false"],
            &["valid_rules:10", "invalid_rules:11"],
            &["identifier:alpha"],
            &["is_transformed:\"true\"", "invalid_rules:12"],
            &["identifier:missing"],
        ];
        for terms in filters {
            let pushed = service.query_aggregated_stats(5, terms).unwrap();
            let scanned = service.aggregate_by_scan(5, terms).unwrap();
            assert_eq!(pushed, scanned, "filters {:?}", terms);
        }
    }

    #[test]
    fn test_counters_are_consistent() {
        let (_dir, service) = seeded_service();
        let stats = service.query_aggregated_stats(5, NO_FILTERS).unwrap();

        assert_eq!(stats.total_records, 40);
        assert_eq!(stats.valid_records + stats.invalid_records(), stats.total_records);
        for rule_id in RULES {
            let counters = stats.rule(rule_id).unwrap();
            assert_eq!(counters.valid_count + counters.invalid_count, 40);
        }
        assert_eq!(stats.rule(10).unwrap().valid_count, 20);
        assert_eq!(stats.rule(12).unwrap().invalid_count, 10);
    }

    #[test]
    fn test_pagination_is_deterministic() {
        let (_dir, service) = seeded_service();

        let mut walked = Vec::new();
        let mut page = 0;
        loop {
            let result = service.query_paginated(5, &["valid_rules:10"], page, 3).unwrap();
            assert_eq!(result.total, 20);
            if result.items.is_empty() {
                break;
            }
            walked.extend(result.items.into_iter().map(|o| o.identifier));
            page += 1;
        }
        assert_eq!(page, 7);

        let mut sorted = walked.clone();
        sorted.sort();
        assert_eq!(walked, sorted);
        assert_eq!(walked.iter().collect::<BTreeSet<_>>().len(), 20);
    }

    #[test]
    fn test_occurrence_counts_sum_to_rule_counts() {
        let (_dir, service) = seeded_service();
        let stats = service.query_aggregated_stats(5, NO_FILTERS).unwrap();
        let counts = service.query_rule_occurrences(5, 12, NO_FILTERS).unwrap();

        let valid_sum: u64 = counts.valid_rule_occrs.iter().map(|c| c.count).sum();
        let invalid_sum: u64 = counts.invalid_rule_occrs.iter().map(|c| c.count).sum();
        let rule = stats.rule(12).unwrap();
        assert_eq!(valid_sum, rule.valid_count);
        assert_eq!(invalid_sum, rule.invalid_count);

        assert_eq!(counts.valid_rule_occrs.len(), 3);
        assert!(counts.valid_rule_occrs.windows(2).all(|w| w[0].count >= w[1].count));
        assert_eq!(counts.invalid_rule_occrs[0].value.as_deref(), Some("xx"));
    }

    #[test]
    fn test_filtered_occurrences_restrict_records() {
        let (_dir, service) = seeded_service();

        let filtered = service.query_rule_occurrences(5, 12, &["identifier:alpha"]).unwrap();
        let total: u64 = filtered
            .valid_rule_occrs
            .iter()
            .chain(filtered.invalid_rule_occrs.iter())
            .map(|c| c.count)
            .sum();
        assert_eq!(total, 8);
    }

    #[test]
    fn test_record_view_and_rule_queries() {
        let (_dir, service) = seeded_service();
        let sample = outcome(3);

        let view = service.get_record_validation(5, &sample.identifier).unwrap().unwrap();
        assert_eq!(view.is_valid, sample.is_valid);
        let fact = view.rule_facts.iter().find(|f| f.rule_id == 12).unwrap();
        assert!(fact.invalid_occurrences.contains(&"xx".to_string()));

        let failed = service.query_by_rule(5, 10, false, 0, 100).unwrap();
        assert_eq!(failed.len(), 20);
        assert!(failed.iter().all(|r| r.rule_results.get(&10) == Some(&false)));
        assert!(failed.windows(2).all(|w| w[0].identifier <= w[1].identifier));
    }

    #[test]
    fn test_paginator_walks_every_record() {
        let (_dir, service) = seeded_service();

        let mut paginator = service.paginator(5);
        paginator.set_page_size(9).unwrap();
        assert_eq!(paginator.total_pages().unwrap(), 5);

        let mut hashes = Vec::new();
        while let Some(page) = paginator.next_page().unwrap() {
            assert!(page.iter().all(|r| r.rule_results.is_empty()));
            hashes.extend(page.into_iter().map(|r| r.identifier_hash));
        }
        assert_eq!(hashes.len(), 40);
        assert!(hashes.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_invalid_filter_is_client_error() {
        let (_dir, service) = seeded_service();

        for bad in ["is_valid:perhaps", "valid_rules:ten", "no-separator"] {
            let err = service.query_aggregated_stats(5, &[bad]).unwrap_err();
            assert_eq!(err.class(), ErrorClass::ClientError, "{}", bad);
            assert!(!service.validate_filters(&[bad]));
        }
        let err = service.query_aggregated_stats(404, NO_FILTERS).unwrap_err();
        assert_eq!(err.class(), ErrorClass::NoStatistics);
    }
}
