use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

/// Tracks active downgrade actions per subsystem.
///
/// Subsystems register here when they fail to initialize or lose a
/// dependency, and resolve once healthy again. The health endpoint exposes
/// the flattened list.
#[derive(Default)]
pub struct DowngradeRegistry {
    issues: Mutex<HashMap<String, Vec<String>>>,
}

impl DowngradeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, component: &str, reason: &str) {
        let entry = format!("{} - {}", Utc::now().to_rfc3339(), reason);
        tracing::warn!("downgrade registered: {}: {}", component, reason);
        self.issues
            .lock()
            .expect("downgrade registry poisoned")
            .entry(component.to_string())
            .or_default()
            .push(entry);
    }

    pub fn resolve(&self, component: &str) {
        self.issues
            .lock()
            .expect("downgrade registry poisoned")
            .remove(component);
    }

    pub fn clear(&self) {
        self.issues
            .lock()
            .expect("downgrade registry poisoned")
            .clear();
    }

    pub fn is_degraded(&self) -> bool {
        self.issues
            .lock()
            .expect("downgrade registry poisoned")
            .values()
            .any(|reasons| !reasons.is_empty())
    }

    pub fn get_active_issues(&self) -> Vec<String> {
        let issues = self.issues.lock().expect("downgrade registry poisoned");
        let mut items = Vec::new();
        for (component, reasons) in issues.iter() {
            for reason in reasons {
                items.push(format!("{}: {}", component, reason));
            }
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_resolve_lifecycle() {
        let registry = DowngradeRegistry::new();
        assert!(!registry.is_degraded());

        registry.register("redis", "connection refused");
        registry.register("redis", "still down");
        registry.register("vector_store", "timeout");

        assert!(registry.is_degraded());
        let issues = registry.get_active_issues();
        assert_eq!(issues.len(), 3);
        assert!(issues.iter().any(|i| i.starts_with("vector_store:")));

        registry.resolve("redis");
        assert!(registry.is_degraded());
        assert_eq!(registry.get_active_issues().len(), 1);

        registry.resolve("vector_store");
        assert!(!registry.is_degraded());
    }

    #[test]
    fn clear_removes_everything() {
        let registry = DowngradeRegistry::new();
        registry.register("db", "pool exhausted");
        registry.clear();
        assert!(registry.get_active_issues().is_empty());
    }
}
