//! Resource Matcher.
//!
//! Ranking order: eligibility completeness (desc), last-updated (desc),
//! category match strength (desc), catalog id (asc). Identical inputs always
//! produce the identical sequence.

use std::cmp::Ordering;

use civicline_core::{
    AttributeValue, EligibilityCriterion, EligibilityRule, IntentCategory, ProfileAttribute,
    Resource, UserProfile,
};

/// Result of testing one criterion against a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CriterionOutcome {
    Satisfied,
    Unsatisfied,
    /// The profile lacks the attribute.
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredResource {
    pub resource: Resource,
    /// Fraction of criteria known to be satisfied, 0..=1.
    pub completeness: f32,
    pub category_strength: f32,
    /// Attributes the user has not provided that the resource tests.
    pub missing: Vec<ProfileAttribute>,
    /// Retired entry offered as a pointer to its replacement.
    pub superseded: bool,
}

/// What the user asked for, as seen by the matcher.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchQuery {
    pub category: IntentCategory,
    pub keywords: Vec<String>,
}

pub fn evaluate(criterion: &EligibilityCriterion, profile: &UserProfile) -> CriterionOutcome {
    let Some(value) = profile.get(criterion.attribute) else {
        return CriterionOutcome::Unknown;
    };
    let satisfied = match (&criterion.rule, value) {
        (EligibilityRule::AtLeast(min), AttributeValue::Number(n)) => n >= min,
        (EligibilityRule::AtMost(max), AttributeValue::Number(n)) => n <= max,
        (EligibilityRule::OneOf(options), AttributeValue::Text(t)) => {
            options.iter().any(|o| o.eq_ignore_ascii_case(t))
        }
        (EligibilityRule::IsTrue, AttributeValue::Flag(b)) => *b,
        // Value of the wrong shape for the rule: cannot decide.
        _ => return CriterionOutcome::Unknown,
    };
    if satisfied {
        CriterionOutcome::Satisfied
    } else {
        CriterionOutcome::Unsatisfied
    }
}

fn category_strength(resource: &Resource, query: &MatchQuery) -> f32 {
    if query.category.catalog_category() == Some(resource.category.as_str()) {
        return 1.0;
    }
    if query.keywords.is_empty() {
        return 0.0;
    }
    let haystack: Vec<String> = resource
        .keywords
        .iter()
        .map(|k| k.to_lowercase())
        .chain(resource.title.split_whitespace().map(str::to_lowercase))
        .collect();
    let hits = query
        .keywords
        .iter()
        .filter(|k| haystack.iter().any(|h| h == *k))
        .count();
    // Keyword overlap never outranks an exact category match.
    (hits as f32 / query.keywords.len() as f32) * 0.9
}

fn rank_order(a: &ScoredResource, b: &ScoredResource) -> Ordering {
    b.completeness
        .total_cmp(&a.completeness)
        .then_with(|| b.resource.last_updated.cmp(&a.resource.last_updated))
        .then_with(|| b.category_strength.total_cmp(&a.category_strength))
        .then_with(|| a.resource.id.cmp(&b.resource.id))
}

pub struct ResourceMatcher {
    max_results: usize,
}

impl ResourceMatcher {
    pub fn new(max_results: usize) -> Self {
        Self {
            max_results: max_results.max(1),
        }
    }

    /// Score one resource; `None` if it does not match the query or the
    /// user is known to be ineligible.
    pub fn score(&self, resource: &Resource, query: &MatchQuery, profile: &UserProfile) -> Option<ScoredResource> {
        let strength = category_strength(resource, query);
        if strength <= 0.0 {
            return None;
        }

        let mut satisfied = 0usize;
        let mut missing = Vec::new();
        for criterion in &resource.eligibility {
            match evaluate(criterion, profile) {
                CriterionOutcome::Satisfied => satisfied += 1,
                CriterionOutcome::Unknown => {
                    if !missing.contains(&criterion.attribute) {
                        missing.push(criterion.attribute);
                    }
                }
                CriterionOutcome::Unsatisfied if resource.informational_only => {}
                CriterionOutcome::Unsatisfied => return None,
            }
        }

        let completeness = if resource.informational_only || resource.eligibility.is_empty() {
            1.0
        } else {
            satisfied as f32 / resource.eligibility.len() as f32
        };

        Some(ScoredResource {
            resource: resource.clone(),
            completeness,
            category_strength: strength,
            missing,
            superseded: false,
        })
    }

    /// Rank the active catalog; fall back to retired near-matches tagged
    /// `superseded` when nothing active matches.
    pub fn find_matches(
        &self,
        query: &MatchQuery,
        profile: &UserProfile,
        active: &[Resource],
        retired: &[Resource],
    ) -> Vec<ScoredResource> {
        let mut ranked: Vec<ScoredResource> = active
            .iter()
            .filter(|r| r.active)
            .filter_map(|r| self.score(r, query, profile))
            .collect();

        if ranked.is_empty() {
            ranked = retired
                .iter()
                .filter(|r| !r.active)
                .filter_map(|r| {
                    let strength = category_strength(r, query);
                    (strength > 0.0).then(|| ScoredResource {
                        resource: r.clone(),
                        completeness: 0.0,
                        category_strength: strength,
                        missing: Vec::new(),
                        superseded: true,
                    })
                })
                .collect();
        }

        ranked.sort_by(rank_order);
        ranked.truncate(self.max_results);
        ranked
    }
}
