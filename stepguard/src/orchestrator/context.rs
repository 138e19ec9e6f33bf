//! Per-item execution context.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use super::StepResult;
use crate::cancellation::CancellationToken;
use crate::checkpoint::CheckpointStore;

/// Everything a step can see about the item it runs for.
///
/// A context belongs to exactly one run. Results are recorded through a
/// shared reference so that concurrently running steps can publish as they
/// settle.
pub struct StepContext {
    item_id: String,
    job_id: Option<String>,
    user_id: String,
    tier: Option<String>,
    credentials: BTreeMap<String, String>,
    payload: Value,
    previous_results: RwLock<HashMap<String, StepResult>>,
    checkpoints: CheckpointStore,
    cancel_token: Arc<CancellationToken>,
}

impl StepContext {
    /// Creates a context with an empty payload and a fresh cancellation token.
    pub fn new(item_id: impl Into<String>, user_id: impl Into<String>, checkpoints: CheckpointStore) -> Self {
        Self {
            item_id: item_id.into(),
            job_id: None,
            user_id: user_id.into(),
            tier: None,
            credentials: BTreeMap::new(),
            payload: Value::Null,
            previous_results: RwLock::new(HashMap::new()),
            checkpoints,
            cancel_token: Arc::new(CancellationToken::new()),
        }
    }

    /// Sets the batch job id.
    #[must_use]
    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Sets the owner's subscription tier.
    #[must_use]
    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    /// Sets the item payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Adds one credential.
    #[must_use]
    pub fn with_credential(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.credentials.insert(key.into(), value.into());
        self
    }

    /// Replaces the credentials.
    #[must_use]
    pub fn with_credentials(mut self, credentials: BTreeMap<String, String>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Shares a cancellation token with the caller.
    #[must_use]
    pub fn with_cancel_token(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancel_token = token;
        self
    }

    /// Item id.
    #[must_use]
    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    /// Batch job id.
    #[must_use]
    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    /// Owner id.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Owner tier.
    #[must_use]
    pub fn tier(&self) -> Option<&str> {
        self.tier.as_deref()
    }

    /// Looks up a credential.
    #[must_use]
    pub fn credential(&self, key: &str) -> Option<&str> {
        self.credentials.get(key).map(String::as_str)
    }

    /// Item payload.
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Checkpoint store for this run.
    #[must_use]
    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.checkpoints
    }

    /// Run-level cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &Arc<CancellationToken> {
        &self.cancel_token
    }

    /// Returns the result recorded for `step` in this run.
    #[must_use]
    pub fn previous_result(&self, step: &str) -> Option<StepResult> {
        self.previous_results.read().get(step).cloned()
    }

    /// Returns the output of `step` if it completed in this run.
    #[must_use]
    pub fn previous_data(&self, step: &str) -> Option<Value> {
        self.previous_results
            .read()
            .get(step)
            .filter(|r| r.is_completed())
            .and_then(|r| r.data.clone())
    }

    /// Returns a copy of every result recorded so far.
    #[must_use]
    pub fn previous_results(&self) -> HashMap<String, StepResult> {
        self.previous_results.read().clone()
    }

    /// Returns true if `step` completed in this run.
    #[must_use]
    pub fn is_completed(&self, step: &str) -> bool {
        self.previous_results
            .read()
            .get(step)
            .is_some_and(StepResult::is_completed)
    }

    /// Records a step's result.
    pub fn record_result(&self, step: impl Into<String>, result: StepResult) {
        self.previous_results.write().insert(step.into(), result);
    }
}

impl fmt::Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Credential values are never printed.
        f.debug_struct("StepContext")
            .field("item_id", &self.item_id)
            .field("job_id", &self.job_id)
            .field("user_id", &self.user_id)
            .field("tier", &self.tier)
            .field("credentials", &self.credentials.keys().collect::<Vec<_>>())
            .field("previous_results", &self.previous_results.read().len())
            .field("cancelled", &self.cancel_token.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> StepContext {
        StepContext::new("p1", "u1", CheckpointStore::in_memory())
            .with_job_id("job-1")
            .with_payload(json!({"name": "Ada Lovelace"}))
            .with_credential("fec_api_key", "secret-value")
    }

    #[test]
    fn test_accessors() {
        let ctx = ctx();
        assert_eq!(ctx.item_id(), "p1");
        assert_eq!(ctx.job_id(), Some("job-1"));
        assert_eq!(ctx.payload()["name"], "Ada Lovelace");
        assert_eq!(ctx.credential("fec_api_key"), Some("secret-value"));
        assert!(!ctx.cancel_token().is_cancelled());
    }

    #[test]
    fn test_debug_redacts_credentials() {
        let rendered = format!("{:?}", ctx());
        assert!(rendered.contains("fec_api_key"));
        assert!(!rendered.contains("secret-value"));
    }

    #[test]
    fn test_previous_results() {
        let ctx = ctx();
        ctx.record_result("search", StepResult::completed(json!({"hits": 1})));
        ctx.record_result("fetch", StepResult::failed("boom"));

        assert!(ctx.is_completed("search"));
        assert!(!ctx.is_completed("fetch"));
        assert!(!ctx.is_completed("missing"));
        assert_eq!(ctx.previous_data("search"), Some(json!({"hits": 1})));
        assert_eq!(ctx.previous_data("fetch"), None);
        assert_eq!(ctx.previous_results().len(), 2);
    }

    #[test]
    fn test_shared_cancel_token() {
        let token = Arc::new(CancellationToken::new());
        let ctx = ctx().with_cancel_token(token.clone());
        token.cancel("operator abort");
        assert!(ctx.cancel_token().is_cancelled());
    }
}
