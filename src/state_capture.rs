//! Opaque module state capture
//!
//! Statistical modules register a pull-based [`StateProvider`]. At freeze
//! time every provider is called once; whatever it returns is stored
//! without interpretation. A provider that errors (or panics) becomes a
//! [`CaptureFailure`] on the bundle instead of a placeholder state, and the
//! freeze carries on.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{ReproError, Result};
use crate::names::validate_name;

/// Versioned, structurally serializable state owned by a module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleStateSnapshot {
    /// Version of the module's own state schema
    pub schema_version: u32,
    pub state: Value,
}

impl ModuleStateSnapshot {
    pub fn new(schema_version: u32, state: Value) -> Self {
        Self {
            schema_version,
            state,
        }
    }
}

/// A module whose state could not be captured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureFailure {
    pub module: String,
    pub error: String,
}

/// Capability a module implements to have its state captured
pub trait StateProvider: Send + Sync {
    fn capture(&self) -> anyhow::Result<ModuleStateSnapshot>;
}

impl<F> StateProvider for F
where
    F: Fn() -> anyhow::Result<ModuleStateSnapshot> + Send + Sync,
{
    fn capture(&self) -> anyhow::Result<ModuleStateSnapshot> {
        self()
    }
}

/// Captured states and failures, both keyed/ordered by module name
pub type CaptureOutcome = (BTreeMap<String, ModuleStateSnapshot>, Vec<CaptureFailure>);

/// Registry of state providers for one session
#[derive(Default)]
pub struct StateCapture {
    providers: Mutex<BTreeMap<String, Arc<dyn StateProvider>>>,
}

impl std::fmt::Debug for StateCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCapture")
            .field("modules", &self.modules())
            .finish()
    }
}

impl StateCapture {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<dyn StateProvider>>> {
        self.providers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register `provider` under `module_name`
    pub fn register(
        &self,
        module_name: &str,
        provider: impl StateProvider + 'static,
    ) -> Result<()> {
        validate_name(module_name)?;
        let mut providers = self.lock();
        if providers.contains_key(module_name) {
            return Err(ReproError::InvalidState(format!(
                "a state provider for '{}' is already registered",
                module_name
            )));
        }
        providers.insert(module_name.to_string(), Arc::new(provider));
        debug!(module = module_name, "state provider registered");
        Ok(())
    }

    /// Registered module names in sorted order
    pub fn modules(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Call every provider once
    pub fn capture_all(&self) -> CaptureOutcome {
        // Clone the providers out so a slow capture does not hold the lock.
        let providers: Vec<(String, Arc<dyn StateProvider>)> = self
            .lock()
            .iter()
            .map(|(name, p)| (name.clone(), Arc::clone(p)))
            .collect();

        let mut states = BTreeMap::new();
        let mut failures = Vec::new();
        for (module, provider) in providers {
            match panic::catch_unwind(AssertUnwindSafe(|| provider.capture())) {
                Ok(Ok(snapshot)) => {
                    states.insert(module, snapshot);
                }
                Ok(Err(e)) => {
                    warn!(module = %module, error = %e, "state capture failed");
                    failures.push(CaptureFailure {
                        module,
                        error: format!("{:#}", e),
                    });
                }
                Err(payload) => {
                    let error = panic_message(payload.as_ref());
                    warn!(module = %module, error = %error, "state provider panicked");
                    failures.push(CaptureFailure {
                        module,
                        error: format!("provider panicked: {}", error),
                    });
                }
            }
        }
        (states, failures)
    }
}

/// Best-effort text of a panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_capture_all_collects_states() {
        let capture = StateCapture::new();
        capture
            .register("power_analysis", || -> anyhow::Result<ModuleStateSnapshot> {
                Ok(ModuleStateSnapshot::new(1, json!({"effect": 0.5, "n": 64})))
            })
            .unwrap();
        capture
            .register("anova", || -> anyhow::Result<ModuleStateSnapshot> {
                Ok(ModuleStateSnapshot::new(2, json!(["f", 3.1])))
            })
            .unwrap();

        let (states, failures) = capture.capture_all();
        assert!(failures.is_empty());
        assert_eq!(states.len(), 2);
        assert_eq!(states["anova"].schema_version, 2);
        assert_eq!(states["power_analysis"].state["n"], json!(64));
    }

    #[test]
    fn test_failing_provider_is_recorded_not_fatal() {
        let capture = StateCapture::new();
        capture
            .register("effect_sizes", || -> anyhow::Result<ModuleStateSnapshot> {
                Err(anyhow::anyhow!("cache not warmed"))
            })
            .unwrap();
        capture
            .register("t_test", || -> anyhow::Result<ModuleStateSnapshot> {
                Ok(ModuleStateSnapshot::new(1, json!({})))
            })
            .unwrap();

        let (states, failures) = capture.capture_all();
        assert!(!states.contains_key("effect_sizes"));
        assert!(states.contains_key("t_test"));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].module, "effect_sizes");
        assert!(failures[0].error.contains("cache not warmed"));
    }

    #[test]
    fn test_panicking_provider_is_recorded() {
        let capture = StateCapture::new();
        capture
            .register("unstable", || -> anyhow::Result<ModuleStateSnapshot> {
                panic!("index out of bounds")
            })
            .unwrap();
        let (states, failures) = capture.capture_all();
        assert!(states.is_empty());
        assert!(failures[0].error.contains("index out of bounds"));
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let capture = StateCapture::new();
        let provider = || -> anyhow::Result<ModuleStateSnapshot> {
            Ok(ModuleStateSnapshot::new(1, Value::Null))
        };
        capture.register("m", provider).unwrap();
        assert!(matches!(
            capture.register("m", provider),
            Err(ReproError::InvalidState(_))
        ));
    }

    #[test]
    fn test_invalid_name_rejected() {
        let capture = StateCapture::new();
        let err = capture
            .register("../escape", || -> anyhow::Result<ModuleStateSnapshot> {
                Ok(ModuleStateSnapshot::new(1, Value::Null))
            })
            .unwrap_err();
        assert!(matches!(err, ReproError::InvalidName { .. }));
    }

    #[test]
    fn test_struct_provider() {
        struct Fitted {
            coefficients: Vec<f64>,
        }
        impl StateProvider for Fitted {
            fn capture(&self) -> anyhow::Result<ModuleStateSnapshot> {
                Ok(ModuleStateSnapshot::new(
                    3,
                    json!({ "coefficients": self.coefficients }),
                ))
            }
        }

        let capture = StateCapture::new();
        capture
            .register(
                "regression",
                Fitted {
                    coefficients: vec![0.3, -1.2],
                },
            )
            .unwrap();
        let (states, _) = capture.capture_all();
        assert_eq!(states["regression"].state["coefficients"], json!([0.3, -1.2]));
        assert_eq!(capture.modules(), vec!["regression".to_string()]);
    }
}
