//! Invariant predicates over batches and follow-up reads.
//!
//! Every predicate returns an [`InvariantVerdict`], pass or fail, with the
//! expected and observed values rendered for diagnostics. A violation is never
//! an error; only input a predicate cannot interpret at all (a successful
//! response whose payload is not an object, mismatched label counts) is.

use std::collections::BTreeSet;
use std::fmt::Display;

use serde::Serialize;

use crate::error::{HarnessError, Result};
use crate::harness::Batch;
use crate::types::{ApiResult, ResourceHandle};

/// Business codes that mean "the backend refused consistently", e.g. stock exhaustion.
pub const INVENTORY_SHORTAGE_CODES: &[&str] =
    &["OUT_OF_STOCK", "INSUFFICIENT_STOCK", "INVENTORY_SHORTAGE"];

/// Business codes a backend answers with when a competing call already moved the resource.
pub const STATE_REFUSAL_CODES: &[&str] = &["CONFLICT", "BAD_REQUEST", "UNPROCESSABLE_ENTITY"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvariantVerdict {
    pub name: String,
    pub expected: String,
    pub observed: String,
    pub passed: bool,
}

impl InvariantVerdict {
    pub fn new(
        name: impl Into<String>,
        expected: impl Display,
        observed: impl Display,
        passed: bool,
    ) -> Self {
        Self {
            name: name.into(),
            expected: expected.to_string(),
            observed: observed.to_string(),
            passed,
        }
    }
}

/// Expected shape of a single response: HTTP status set, success flag, code set.
///
/// Empty sets mean "don't care".
#[derive(Debug, Clone, Copy)]
pub struct Expectation {
    pub http: &'static [u16],
    pub success: Option<bool>,
    pub codes: &'static [&'static str],
}

impl Expectation {
    pub const fn ok(http: &'static [u16], codes: &'static [&'static str]) -> Self {
        Self {
            http,
            success: Some(true),
            codes,
        }
    }

    pub fn matches(&self, result: &ApiResult) -> bool {
        (self.http.is_empty() || result.status_in(self.http))
            && self.success.is_none_or(|s| result.success() == s)
            && (self.codes.is_empty() || self.codes.iter().any(|c| *c == result.code()))
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if !self.http.is_empty() {
            parts.push(format!("http in {:?}", self.http));
        }
        if let Some(success) = self.success {
            parts.push(format!("success={}", success));
        }
        if !self.codes.is_empty() {
            parts.push(format!("code in {:?}", self.codes));
        }
        parts.join(" ")
    }
}

/// Failures that count as consistent outcomes rather than defects.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    codes: BTreeSet<String>,
    /// When set, a success is only acceptable with one of these HTTP statuses.
    success_http: Option<Vec<u16>>,
}

impl AllowList {
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            codes: codes.into_iter().map(Into::into).collect(),
            success_http: None,
        }
    }

    pub fn inventory_shortage() -> Self {
        Self::new(INVENTORY_SHORTAGE_CODES.iter().copied())
    }

    pub fn state_refusal() -> Self {
        Self::new(STATE_REFUSAL_CODES.iter().copied())
    }

    pub fn require_success_status(mut self, statuses: &[u16]) -> Self {
        self.success_http = Some(statuses.to_vec());
        self
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.codes.iter().map(String::as_str)
    }

    pub fn permits(&self, result: &ApiResult) -> bool {
        if result.success() {
            return match &self.success_http {
                Some(statuses) => result.status_in(statuses),
                None => true,
            };
        }
        // A missing response or a server fault is never an allowed business failure
        result.failure.is_none()
            && result.status.is_some_and(|s| (400..500).contains(&s))
            && self.codes.contains(result.code())
    }
}

/// Distinct non-empty identifiers among successful results must number exactly one.
pub fn unique_identifier<F>(name: &str, batch: &Batch, extract: F) -> Result<InvariantVerdict>
where
    F: Fn(&ApiResult) -> Result<Option<ResourceHandle>>,
{
    let distinct = batch.distinct_identifiers(extract)?;
    Ok(InvariantVerdict::new(
        name,
        1,
        format!("{} {:?}", distinct.len(), names(&distinct)),
        distinct.len() == 1,
    ))
}

/// Every result is a success or a failure whose code is on the allow-list.
pub fn all_success_or_allowed_failure(
    name: &str,
    batch: &Batch,
    allowed: &AllowList,
) -> InvariantVerdict {
    let violations: Vec<String> = batch
        .iter()
        .filter(|r| !allowed.permits(r))
        .map(ApiResult::summary)
        .collect();
    let observed = if violations.is_empty() {
        format!("all {} acceptable", batch.len())
    } else {
        format!("{} violation(s): {:?}", violations.len(), violations)
    };
    InvariantVerdict::new(
        name,
        format!(
            "success or code in {:?}",
            allowed.codes().collect::<Vec<_>>()
        ),
        observed,
        violations.is_empty(),
    )
}

/// `len(ids) - len(distinct(ids)) <= bound`
pub fn duplicate_count_at_most(
    name: &str,
    identifiers: &[ResourceHandle],
    bound: usize,
) -> InvariantVerdict {
    let distinct: BTreeSet<&ResourceHandle> = identifiers.iter().collect();
    let duplicates = identifiers.len() - distinct.len();
    InvariantVerdict::new(
        name,
        format!("<= {}", bound),
        duplicates,
        duplicates <= bound,
    )
}

/// Mutual exclusion: among competing operations at most one reports success.
pub fn at_most_one_success(name: &str, labels: &[&str], batch: &Batch) -> Result<InvariantVerdict> {
    let winners = winners(labels, batch)?;
    Ok(InvariantVerdict::new(
        name,
        "<= 1",
        format!("{} {:?}", winners.len(), winners),
        winners.len() <= 1,
    ))
}

/// Exactly one follow-up row carries the correlation key, however many times the write was attempted.
pub fn exactly_one_side_effect(
    name: &str,
    correlation_key: &str,
    observed_keys: &[String],
) -> InvariantVerdict {
    let count = observed_keys
        .iter()
        .filter(|k| k.as_str() == correlation_key)
        .count();
    InvariantVerdict::new(
        name,
        format!("1 row with {}", correlation_key),
        count,
        count == 1,
    )
}

/// `after - before >= expected_minimum`
pub fn monotonic_total_increase(
    name: &str,
    before: i64,
    after: i64,
    expected_minimum: i64,
) -> InvariantVerdict {
    let delta = after - before;
    InvariantVerdict::new(
        name,
        format!(">= {}", expected_minimum),
        delta,
        delta >= expected_minimum,
    )
}

/// Single response matches its step's expectation.
pub fn response_matches(name: &str, result: &ApiResult, expected: &Expectation) -> InvariantVerdict {
    InvariantVerdict::new(
        name,
        expected.describe(),
        result.summary(),
        expected.matches(result),
    )
}

/// A competing operation either won with its expected response or was refused
/// with a 4xx code from `refusals`.
///
/// Transport failures, timeouts and server faults are neither.
pub fn won_or_refused(
    name: &str,
    result: &ApiResult,
    expected: &Expectation,
    refusals: &AllowList,
) -> InvariantVerdict {
    let passed = if result.success() {
        expected.matches(result)
    } else {
        refusals.permits(result)
    };
    InvariantVerdict::new(
        name,
        format!(
            "({}) or a refusal with code in {:?}",
            expected.describe(),
            refusals.codes().collect::<Vec<_>>()
        ),
        result.summary(),
        passed,
    )
}

/// Every member succeeded with one of the given HTTP statuses.
pub fn all_succeeded(name: &str, batch: &Batch, http: &[u16]) -> InvariantVerdict {
    let bad: Vec<String> = batch
        .iter()
        .filter(|r| !(r.success() && r.status_in(http)))
        .map(ApiResult::summary)
        .collect();
    let observed = if bad.is_empty() {
        format!("{}/{} succeeded", batch.len(), batch.len())
    } else {
        format!("{} non-success: {:?}", bad.len(), bad)
    };
    InvariantVerdict::new(
        name,
        format!("all success with http in {:?}", http),
        observed,
        bad.is_empty(),
    )
}

pub fn at_least_one_success(name: &str, batch: &Batch) -> InvariantVerdict {
    let count = batch.success_count();
    InvariantVerdict::new(
        name,
        ">= 1",
        format!("{} of {} {:?}", count, batch.len(), batch.outcomes()),
        count >= 1,
    )
}

/// Observed value is one of the allowed values.
pub fn value_in<T: Display + PartialEq>(name: &str, observed: Option<T>, allowed: &[T]) -> InvariantVerdict {
    let rendered_allowed: Vec<String> = allowed.iter().map(ToString::to_string).collect();
    let passed = observed.as_ref().is_some_and(|o| allowed.contains(o));
    let observed = match observed {
        Some(value) => value.to_string(),
        None => "<missing>".to_string(),
    };
    InvariantVerdict::new(
        name,
        format!("one of {:?}", rendered_allowed),
        observed,
        passed,
    )
}

/// The follow-up read shows exactly the effects of the operations that reported success.
///
/// `visible[i]` says whether the effect of operation `i` shows in the read.
/// Passes iff each effect is visible exactly when its operation succeeded and
/// at most one effect is visible.
pub fn race_outcome_consistent(
    name: &str,
    labels: &[&str],
    batch: &Batch,
    visible: &[bool],
) -> Result<InvariantVerdict> {
    if visible.len() != labels.len() {
        return Err(HarnessError::InvalidRequest(format!(
            "{}: {} labels but {} visibility flags",
            name,
            labels.len(),
            visible.len()
        )));
    }
    let winners = winners(labels, batch)?;
    let shown: Vec<&str> = labels
        .iter()
        .zip(visible)
        .filter(|(_, v)| **v)
        .map(|(l, _)| *l)
        .collect();
    let passed = shown.len() <= 1 && shown == winners;
    Ok(InvariantVerdict::new(
        name,
        format!("visible effects == succeeded {:?}", winners),
        format!("visible {:?}", shown),
        passed,
    ))
}

fn winners<'a>(labels: &[&'a str], batch: &Batch) -> Result<Vec<&'a str>> {
    if labels.len() != batch.len() {
        return Err(HarnessError::InvalidRequest(format!(
            "{} labels for a batch of {}",
            labels.len(),
            batch.len()
        )));
    }
    Ok(labels
        .iter()
        .zip(batch.iter())
        .filter(|(_, r)| r.success())
        .map(|(l, _)| *l)
        .collect())
}

fn names(handles: &BTreeSet<ResourceHandle>) -> Vec<&str> {
    handles.iter().map(ResourceHandle::as_str).collect()
}
