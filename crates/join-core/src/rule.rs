//! Allow rules and the allow-rule matcher.
//!
//! # Semantics
//!
//! - Within one rule, every **set** field must be satisfied by the claims
//!   (logical AND). Unset fields impose no constraint. A field holding `null`
//!   or the empty string is unset.
//! - Across rules, any matching rule admits the claims (logical OR).
//! - An empty rule list admits nothing.
//! - A rule with no set fields admits everything. Callers that load policy
//!   should surface such rules to operators ([`AllowRule::is_wildcard`]).
//!
//! Rules are evaluated in declaration order so the reported match index is
//! deterministic. The boolean result does not depend on order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::claims::Claims;

/// One admissible combination of claim constraints.
///
/// Serialized as a plain map: `{ project_id: "p", context_id: "c" }`. A key
/// mapped to `null` or `""` is the same as an absent key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AllowRule {
    fields: BTreeMap<String, Option<String>>,
}

impl AllowRule {
    /// Create a rule with no fields set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: require `name` to satisfy `value`.
    #[must_use]
    pub fn require(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), Some(value.into()));
        self
    }

    /// Iterate the set fields as `(name, required value)`.
    pub fn constraints(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().filter_map(|(name, value)| match value.as_deref() {
            Some(v) if !v.is_empty() => Some((name.as_str(), v)),
            _ => None,
        })
    }

    /// `true` when no field is set, so the rule matches any claims.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.constraints().next().is_none()
    }

    /// Whether every set field is satisfied by `claims`.
    #[must_use]
    pub fn matches(&self, claims: &Claims) -> bool {
        self.constraints()
            .all(|(name, required)| claims.attribute(name).satisfies(required))
    }
}

impl<K, V> FromIterator<(K, V)> for AllowRule
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), Some(v.into())))
                .collect(),
        }
    }
}

/// Index of the first rule (in declaration order) that admits `claims`.
#[must_use]
pub fn first_match(claims: &Claims, rules: &[AllowRule]) -> Option<usize> {
    rules.iter().position(|rule| rule.matches(claims))
}

/// Whether any rule admits `claims`. An empty list never matches.
#[must_use]
pub fn matches(claims: &Claims, rules: &[AllowRule]) -> bool {
    first_match(claims, rules).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circleci_claims() -> Claims {
        Claims::new("org/o/project/p/user/u")
            .with_scalar("project_id", "P")
            .with_list("context_id", ["A", "B"])
    }

    #[test]
    fn both_fields_matching_admits() {
        let rule = AllowRule::new()
            .require("project_id", "P")
            .require("context_id", "A");

        assert!(matches(&circleci_claims(), &[rule]));
    }

    #[test]
    fn unset_field_is_ignored() {
        let rule = AllowRule::new().require("context_id", "B");

        assert!(matches(&circleci_claims(), &[rule]));
    }

    #[test]
    fn either_field_mismatch_breaks_the_rule() {
        let claims = circleci_claims();
        let bad_context = AllowRule::new()
            .require("project_id", "P")
            .require("context_id", "C");
        let bad_project = AllowRule::new()
            .require("project_id", "other")
            .require("context_id", "A");

        assert!(!matches(&claims, &[bad_context]));
        assert!(!matches(&claims, &[bad_project]));
    }

    #[test]
    fn any_rule_may_admit() {
        let claims = circleci_claims();
        let miss = AllowRule::new().require("project_id", "other");
        let hit = AllowRule::new().require("context_id", "B");

        assert!(matches(&claims, &[miss.clone(), hit.clone()]));
        assert!(matches(&claims, &[hit, miss]));
    }

    #[test]
    fn first_match_reports_declaration_order() {
        let claims = circleci_claims();
        let rules = vec![
            AllowRule::new().require("project_id", "other"),
            AllowRule::new().require("context_id", "A"),
            AllowRule::new().require("context_id", "B"),
        ];

        assert_eq!(first_match(&claims, &rules), Some(1));
    }

    #[test]
    fn empty_rule_list_never_matches() {
        assert!(!matches(&circleci_claims(), &[]));
        assert!(!matches(&Claims::default(), &[]));
    }

    #[test]
    fn wildcard_rule_matches_everything() {
        let wildcard = AllowRule::new();

        assert!(wildcard.is_wildcard());
        assert!(matches(&circleci_claims(), &[wildcard.clone()]));
        assert!(matches(&Claims::default(), &[wildcard]));
    }

    #[test]
    fn rule_on_unknown_attribute_never_matches() {
        let rule = AllowRule::new().require("repository", "org/repo");

        assert!(!matches(&circleci_claims(), &[rule]));
    }

    #[test]
    fn null_field_deserializes_as_unset() {
        let rule: AllowRule =
            serde_json::from_str(r#"{"project_id": null, "context_id": "A"}"#).unwrap();

        assert!(!rule.is_wildcard());
        assert_eq!(rule.constraints().collect::<Vec<_>>(), vec![("context_id", "A")]);
        assert!(rule.matches(&circleci_claims()));
    }

    #[test]
    fn all_null_rule_is_wildcard() {
        let rule: AllowRule = serde_json::from_str(r#"{"project_id": null}"#).unwrap();

        assert!(rule.is_wildcard());
    }

    #[test]
    fn empty_string_field_is_unset() {
        // GIVEN: a rule whose project field is present but empty
        let rule: AllowRule =
            serde_json::from_str(r#"{"project_id": "", "context_id": "A"}"#).unwrap();

        // THEN: only the context constrains the claims
        assert_eq!(rule.constraints().collect::<Vec<_>>(), vec![("context_id", "A")]);
        assert!(matches(&circleci_claims(), &[rule]));
    }

    #[test]
    fn all_empty_rule_is_wildcard() {
        let rule = AllowRule::new().require("project_id", "");

        assert!(rule.is_wildcard());
        assert!(rule.matches(&Claims::default()));
    }

    #[test]
    fn rule_from_pairs() {
        let rule: AllowRule = [("project_id", "P"), ("context_id", "A")].into_iter().collect();

        assert!(rule.matches(&circleci_claims()));
    }
}
