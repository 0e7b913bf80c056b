//! Criteria evaluation boundary.
//!
//! The expression language behind trigger criteria lives outside this crate.
//! [`CriteriaMatcher`] is the seam; [`BoundedMatcher`] wraps it with the
//! timeout and panic isolation every evaluation runs under, and combines
//! before/after query criteria.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use octofhir_core::ChangeKind;
use octofhir_core::events::{Isolated, run_isolated};
use serde_json::Value;
use tracing::debug;

use crate::error::EvaluationError;
use crate::types::QueryCriteria;

/// Default upper bound for one criteria evaluation.
pub const DEFAULT_MATCHER_TIMEOUT: Duration = Duration::from_secs(1);

/// Evaluates trigger criteria against a resource.
#[async_trait]
pub trait CriteriaMatcher: Send + Sync {
    /// Whether `resource` satisfies a FHIRPath `expression`.
    async fn matches(&self, resource: &Value, expression: &str) -> Result<bool, EvaluationError>;

    /// Whether `resource` satisfies search-style `query` criteria
    /// (e.g. `status=in-progress&class=IMP`).
    async fn matches_query(&self, _resource: &Value, query: &str) -> Result<bool, EvaluationError> {
        Err(EvaluationError::unsupported(format!("query criteria '{query}'")))
    }
}

pub type DynMatcher = Arc<dyn CriteriaMatcher>;

/// A matcher call bounded by a timeout, with panics turned into errors.
#[derive(Clone)]
pub struct BoundedMatcher {
    inner: DynMatcher,
    timeout: Duration,
}

impl BoundedMatcher {
    pub fn new(inner: DynMatcher, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub async fn matches(&self, resource: &Value, expression: &str) -> Result<bool, EvaluationError> {
        let outcome = run_isolated(self.timeout, self.inner.matches(resource, expression)).await;
        self.flatten(expression, outcome)
    }

    pub async fn matches_query(&self, resource: &Value, query: &str) -> Result<bool, EvaluationError> {
        let outcome = run_isolated(self.timeout, self.inner.matches_query(resource, query)).await;
        self.flatten(query, outcome)
    }

    fn flatten(
        &self,
        expression: &str,
        outcome: Isolated<Result<bool, EvaluationError>>,
    ) -> Result<bool, EvaluationError> {
        match outcome {
            Isolated::Completed(result) => result,
            Isolated::Panicked(msg) => Err(EvaluationError::expression(
                expression,
                format!("matcher panicked: {msg}"),
            )),
            Isolated::TimedOut => Err(EvaluationError::Timeout {
                expression: expression.to_string(),
                timeout: self.timeout,
            }),
        }
    }

    /// Evaluate before/after query criteria for one change.
    ///
    /// `previous` is the state before the change, `current` the state after.
    /// Only sides that declare criteria are tested: on create the previous
    /// side takes `result_for_create`, on delete the current side takes
    /// `result_for_delete`, and `no-test` drops the side. Tested sides are
    /// combined with AND under `require_both`, OR otherwise.
    ///
    /// A side whose state is unavailable cannot pass. Under `require_both`
    /// that fails the criteria; otherwise the side is dropped, and if that
    /// leaves nothing tested the criteria fail.
    pub async fn evaluate_query(
        &self,
        criteria: &QueryCriteria,
        kind: ChangeKind,
        previous: Option<&Value>,
        current: Option<&Value>,
    ) -> Result<bool, EvaluationError> {
        let mut unresolved = false;

        let previous_outcome = match criteria.previous.as_deref() {
            None => None,
            Some(_) if kind == ChangeKind::Created => criteria.result_for_create.as_outcome(),
            Some(query) => match previous {
                Some(state) => Some(self.matches_query(state, query).await?),
                None => {
                    debug!(query, "Previous state unavailable, previous criteria not tested");
                    unresolved = true;
                    None
                }
            },
        };

        let current_outcome = match criteria.current.as_deref() {
            None => None,
            Some(_) if kind == ChangeKind::Deleted => criteria.result_for_delete.as_outcome(),
            Some(query) => match current {
                Some(state) => Some(self.matches_query(state, query).await?),
                None => {
                    unresolved = true;
                    None
                }
            },
        };

        Ok(combine(previous_outcome, current_outcome, criteria.require_both, unresolved))
    }
}

fn combine(previous: Option<bool>, current: Option<bool>, require_both: bool, unresolved: bool) -> bool {
    if require_both && unresolved {
        return false;
    }
    let tested: Vec<bool> = [previous, current].into_iter().flatten().collect();
    if tested.is_empty() {
        return !unresolved;
    }
    if require_both {
        tested.iter().all(|&r| r)
    } else {
        tested.iter().any(|&r| r)
    }
}

impl std::fmt::Debug for BoundedMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedMatcher")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Minimal matcher for unit tests.
///
/// Expressions are `field = value` against top-level scalars; queries are
/// `field=value` or `field:not=value` clauses joined with `&`.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub(crate) struct FieldMatcher;

    fn field_equals(resource: &Value, field: &str, expected: &str) -> bool {
        match resource.get(field) {
            Some(Value::String(s)) => s == expected,
            Some(Value::Bool(b)) => b.to_string() == expected,
            Some(Value::Number(n)) => n.to_string() == expected,
            _ => false,
        }
    }

    #[async_trait]
    impl CriteriaMatcher for FieldMatcher {
        async fn matches(&self, resource: &Value, expression: &str) -> Result<bool, EvaluationError> {
            let (field, expected) = expression
                .split_once('=')
                .ok_or_else(|| EvaluationError::expression(expression, "expected 'field = value'"))?;
            Ok(field_equals(resource, field.trim(), expected.trim()))
        }

        async fn matches_query(&self, resource: &Value, query: &str) -> Result<bool, EvaluationError> {
            for clause in query.split('&') {
                let (param, expected) = clause
                    .split_once('=')
                    .ok_or_else(|| EvaluationError::expression(query, "expected 'param=value'"))?;
                let hit = match param.strip_suffix(":not") {
                    Some(field) => !field_equals(resource, field, expected),
                    None => field_equals(resource, param, expected),
                };
                if !hit {
                    return Ok(false);
                }
            }
            Ok(true)
        }
    }
}
