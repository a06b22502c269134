//! Business Hook Dispatcher (C4)
//!
//! The source resolves a per-domain transform by dynamically importing
//! `business_logic.<domain>` and calling its `process` entry point
//! (spec.md §9, "Dynamic module dispatch"). In this port that becomes a
//! static registry built at startup: a map from lowercased domain token to
//! a `BusinessHook` trait object. An unregistered domain is non-fatal --
//! log a warning and continue (spec.md §4.4, §7).

use crate::normalize::RowBatch;
use std::collections::HashMap;
use std::sync::Arc;

/// A per-domain transform applied in place to a normalised row batch.
/// Errors propagate to the caller: the hook is trusted code, and in the
/// change-capture loop a hook error triggers BACKOFF, while in the override
/// planner it fails just that sub-window (spec.md §7).
pub trait BusinessHook: Send + Sync {
    fn process(&self, batch: &mut RowBatch) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<String, Arc<dyn BusinessHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook under `business_logic.<domain-lowercased>`, matching
    /// the source's module naming convention.
    pub fn register(&mut self, domain: &str, hook: Arc<dyn BusinessHook>) {
        self.hooks.insert(domain.to_lowercase(), hook);
    }

    /// Apply the hook registered for `domain`, if any. Absence is logged
    /// and is not an error.
    pub fn apply_hook(&self, domain: &str, batch: &mut RowBatch) -> anyhow::Result<()> {
        let key = domain.to_lowercase();
        match self.hooks.get(&key) {
            Some(hook) => hook.process(batch),
            None => {
                tracing::warn!(domain = %domain, "no business hook registered, proceeding as-is");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::CellValue;

    struct UppercaseHook;

    impl BusinessHook for UppercaseHook {
        fn process(&self, batch: &mut RowBatch) -> anyhow::Result<()> {
            for row in &mut batch.rows {
                for cell in row {
                    if let CellValue::Text(s) = cell {
                        *s = s.to_uppercase();
                    }
                }
            }
            Ok(())
        }
    }

    struct FailingHook;

    impl BusinessHook for FailingHook {
        fn process(&self, _batch: &mut RowBatch) -> anyhow::Result<()> {
            anyhow::bail!("hook exploded")
        }
    }

    fn sample_batch() -> RowBatch {
        RowBatch {
            columns: vec!["name".into()],
            rows: vec![vec![CellValue::Text("asset".into())]],
        }
    }

    #[test]
    fn missing_hook_is_non_fatal() {
        let registry = HookRegistry::new();
        let mut batch = sample_batch();
        registry.apply_hook("ASSET", &mut batch).unwrap();
        assert_eq!(batch.rows[0][0], CellValue::Text("asset".into()));
    }

    #[test]
    fn registered_hook_mutates_in_place() {
        let mut registry = HookRegistry::new();
        registry.register("ASSET", Arc::new(UppercaseHook));
        let mut batch = sample_batch();
        registry.apply_hook("ASSET", &mut batch).unwrap();
        assert_eq!(batch.rows[0][0], CellValue::Text("ASSET".into()));
    }

    #[test]
    fn hook_lookup_is_case_insensitive_on_domain() {
        let mut registry = HookRegistry::new();
        registry.register("asset", Arc::new(UppercaseHook));
        let mut batch = sample_batch();
        registry.apply_hook("ASSET", &mut batch).unwrap();
        assert_eq!(batch.rows[0][0], CellValue::Text("ASSET".into()));
    }

    #[test]
    fn hook_error_propagates() {
        let mut registry = HookRegistry::new();
        registry.register("ASSET", Arc::new(FailingHook));
        let mut batch = sample_batch();
        assert!(registry.apply_hook("ASSET", &mut batch).is_err());
    }
}
