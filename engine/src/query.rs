//! Attribute queries over the beans of a channel.
//!
//! A query is a set of `(path, expected)` criteria combined with one of two
//! combinators (all / at least one), compared by exact equality or substring
//! containment, and optionally negated.
//!
//! # Matching rules
//!
//! - A field absent from a bean never satisfies a criterion.
//! - Negation is applied per criterion: a negated `All` query matches beans
//!   that fail *every* criterion, a negated `AtLeastOne` query matches beans
//!   that fail *at least one*.
//! - Proxies carry no attributes and never match.
//!
//! # Empty criteria
//!
//! With no criteria, a positive `All` query matches every hydrated bean;
//! every other form matches nothing.

use crate::attributes::AttributeStore;
use crate::error::Result;
use crate::path::FieldPath;
use crate::BeanRecord;
use serde::{Deserialize, Serialize};

/// How per-criterion results are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Combinator {
    All,
    AtLeastOne,
}

/// How a stored value is compared with the expected value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Comparator {
    Equals,
    Contains,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Polarity {
    Positive,
    Negated,
}

/// The six query forms exposed by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryMode {
    EqualsAll,
    EqualsAtLeastOne,
    NotEqualsAll,
    NotEqualsAtLeastOne,
    ContainsAll,
    ContainsAtLeastOne,
}

impl QueryMode {
    pub fn parts(self) -> (Combinator, Comparator, Polarity) {
        use Combinator::*;
        use Comparator::*;
        use Polarity::*;
        match self {
            QueryMode::EqualsAll => (All, Equals, Positive),
            QueryMode::EqualsAtLeastOne => (AtLeastOne, Equals, Positive),
            QueryMode::NotEqualsAll => (All, Equals, Negated),
            QueryMode::NotEqualsAtLeastOne => (AtLeastOne, Equals, Negated),
            QueryMode::ContainsAll => (All, Contains, Positive),
            QueryMode::ContainsAtLeastOne => (AtLeastOne, Contains, Positive),
        }
    }
}

/// Ordered `path -> expected value` criteria.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Criteria {
    entries: Vec<(String, String)>,
}

impl Criteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut criteria = Self::new();
        for (path, value) in pairs {
            criteria.insert(path.as_ref(), value)?;
        }
        Ok(criteria)
    }

    /// Add a criterion. Re-adding a path replaces its expected value in place.
    pub fn insert(&mut self, path: &str, expected: impl Into<String>) -> Result<()> {
        let key = FieldPath::parse(path)?.canonical();
        let expected = expected.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = expected,
            None => self.entries.push((key, expected)),
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A fully specified query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub combinator: Combinator,
    pub comparator: Comparator,
    pub polarity: Polarity,
    pub criteria: Criteria,
}

impl Query {
    pub fn new(mode: QueryMode, criteria: Criteria) -> Self {
        let (combinator, comparator, polarity) = mode.parts();
        Self {
            combinator,
            comparator,
            polarity,
            criteria,
        }
    }

    /// Evaluate against a bean. Proxies never match.
    pub fn matches(&self, record: &BeanRecord) -> bool {
        match record.data() {
            Some(data) => self.matches_attributes(&data.attributes),
            None => false,
        }
    }

    pub fn matches_attributes(&self, attributes: &AttributeStore) -> bool {
        if self.criteria.is_empty() {
            return self.combinator == Combinator::All && self.polarity == Polarity::Positive;
        }

        let want = self.polarity == Polarity::Positive;
        let mut outcomes = self
            .criteria
            .iter()
            .map(|(key, expected)| self.criterion_holds(attributes, key, expected) == want);

        match self.combinator {
            Combinator::All => outcomes.all(|ok| ok),
            Combinator::AtLeastOne => outcomes.any(|ok| ok),
        }
    }

    /// Filter records in iteration order.
    pub fn filter<'a, I>(&self, records: I) -> Vec<&'a BeanRecord>
    where
        I: IntoIterator<Item = &'a BeanRecord>,
    {
        records.into_iter().filter(|r| self.matches(r)).collect()
    }

    fn criterion_holds(&self, attributes: &AttributeStore, key: &str, expected: &str) -> bool {
        let Some(actual) = attributes.value_by_key(key) else {
            return false;
        };
        match self.comparator {
            Comparator::Equals => actual == expected,
            Comparator::Contains => actual.contains(expected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{BeanBody, BeanData};

    fn bean(id: &str, pairs: &[(&str, &str)]) -> BeanRecord {
        let attributes = AttributeStore::from_pairs(pairs.iter().copied()).unwrap();
        BeanRecord::from_cloud("orders", id, BeanBody::Hydrated(BeanData::new(attributes)))
    }

    fn orders() -> Vec<BeanRecord> {
        vec![
            bean("o-1", &[("status", "open"), ("region", "west")]),
            bean("o-2", &[("status", "open"), ("region", "east")]),
            bean("o-3", &[("status", "closed"), ("region", "west")]),
            bean("o-4", &[("status", "closed"), ("region", "north")]),
            bean("o-5", &[("status", "open")]),
        ]
    }

    fn ids(records: Vec<&BeanRecord>) -> Vec<&str> {
        records.into_iter().map(|r| r.local_id.as_str()).collect()
    }

    fn run(mode: QueryMode, pairs: &[(&str, &str)]) -> Vec<String> {
        let criteria = Criteria::from_pairs(pairs.iter().copied()).unwrap();
        let records = orders();
        ids(Query::new(mode, criteria).filter(&records))
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    const OPEN_WEST: &[(&str, &str)] = &[("status", "open"), ("region", "west")];

    #[test]
    fn equals_all() {
        assert_eq!(run(QueryMode::EqualsAll, OPEN_WEST), vec!["o-1"]);
    }

    #[test]
    fn equals_at_least_one() {
        assert_eq!(
            run(QueryMode::EqualsAtLeastOne, OPEN_WEST),
            vec!["o-1", "o-2", "o-3", "o-5"]
        );
    }

    #[test]
    fn not_equals_all_matches_beans_failing_every_criterion() {
        assert_eq!(run(QueryMode::NotEqualsAll, OPEN_WEST), vec!["o-4"]);
    }

    #[test]
    fn not_equals_at_least_one_is_complement_of_equals_all() {
        assert_eq!(
            run(QueryMode::NotEqualsAtLeastOne, OPEN_WEST),
            vec!["o-2", "o-3", "o-4", "o-5"]
        );
    }

    #[test]
    fn contains_variants() {
        let pairs = &[("status", "clo"), ("region", "or")];
        assert_eq!(run(QueryMode::ContainsAll, pairs), vec!["o-4"]);
        assert_eq!(run(QueryMode::ContainsAtLeastOne, pairs), vec!["o-3", "o-4"]);
    }

    #[test]
    fn absent_field_never_matches() {
        assert_eq!(run(QueryMode::EqualsAll, &[("region", "")]), Vec::<String>::new());
        assert_eq!(
            run(QueryMode::ContainsAll, &[("priority", "")]),
            Vec::<String>::new()
        );
    }

    #[test]
    fn empty_criteria_policy() {
        assert_eq!(run(QueryMode::EqualsAll, &[]).len(), 5);
        assert_eq!(run(QueryMode::ContainsAll, &[]).len(), 5);
        assert!(run(QueryMode::EqualsAtLeastOne, &[]).is_empty());
        assert!(run(QueryMode::ContainsAtLeastOne, &[]).is_empty());
        assert!(run(QueryMode::NotEqualsAll, &[]).is_empty());
        assert!(run(QueryMode::NotEqualsAtLeastOne, &[]).is_empty());
    }

    #[test]
    fn proxies_never_match() {
        let proxy = BeanRecord::from_cloud("orders", "p-1", BeanBody::Proxy);
        let query = Query::new(QueryMode::EqualsAll, Criteria::new());
        assert!(!query.matches(&proxy));
    }

    #[test]
    fn criteria_paths_are_canonical() {
        let mut criteria = Criteria::new();
        criteria.insert("/status", "open").unwrap();
        criteria.insert("status", "closed").unwrap();
        assert_eq!(criteria.len(), 1);
        assert_eq!(criteria.iter().next(), Some(("status", "closed")));
        assert!(criteria.insert("a..b", "x").is_err());
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_value() -> impl Strategy<Value = Option<String>> {
            prop_oneof![
                Just(None),
                Just(Some("open".to_string())),
                Just(Some("closed".to_string())),
                Just(Some("reopened".to_string())),
            ]
        }

        fn arb_bean() -> impl Strategy<Value = BeanRecord> {
            (arb_value(), arb_value()).prop_map(|(status, region)| {
                let mut attributes = AttributeStore::new();
                if let Some(status) = status {
                    attributes.set("status", status).unwrap();
                }
                if let Some(region) = region {
                    attributes.set("region", region).unwrap();
                }
                BeanRecord::from_cloud("orders", "x", BeanBody::Hydrated(BeanData::new(attributes)))
            })
        }

        fn arb_criteria() -> impl Strategy<Value = Criteria> {
            (
                prop::option::of("open|closed|pen"),
                prop::option::of("open|closed|pen"),
            )
                .prop_map(|(status, region)| {
                    let mut criteria = Criteria::new();
                    if let Some(status) = status {
                        criteria.insert("status", status).unwrap();
                    }
                    if let Some(region) = region {
                        criteria.insert("region", region).unwrap();
                    }
                    criteria
                })
        }

        proptest! {
            #[test]
            fn prop_not_equals_at_least_one_complements_equals_all(
                record in arb_bean(),
                criteria in arb_criteria(),
            ) {
                let all = Query::new(QueryMode::EqualsAll, criteria.clone());
                let not_one = Query::new(QueryMode::NotEqualsAtLeastOne, criteria);
                prop_assert_ne!(all.matches(&record), not_one.matches(&record));
            }

            #[test]
            fn prop_not_equals_all_complements_equals_at_least_one(
                record in arb_bean(),
                criteria in arb_criteria(),
            ) {
                prop_assume!(!criteria.is_empty());
                let any = Query::new(QueryMode::EqualsAtLeastOne, criteria.clone());
                let none = Query::new(QueryMode::NotEqualsAll, criteria);
                prop_assert_ne!(any.matches(&record), none.matches(&record));
            }

            #[test]
            fn prop_equals_implies_contains(
                record in arb_bean(),
                criteria in arb_criteria(),
            ) {
                let equals = Query::new(QueryMode::EqualsAll, criteria.clone());
                let contains = Query::new(QueryMode::ContainsAll, criteria);
                prop_assert!(!equals.matches(&record) || contains.matches(&record));
            }
        }
    }
}
