//! Per-batch draw information

use std::any::Any;
use std::collections::HashMap;

/// Values shared between the passes of a batch
///
/// Pass callbacks read and write named values here; compute passes read the
/// dispatch-size override.
#[derive(Debug, Default)]
pub struct CustomDrawInfo {
    /// Dispatch size override; zero axes use the pass default
    pub compute_groups: [u32; 3],
    values: HashMap<String, Box<dyn Any + Send>>,
}

impl CustomDrawInfo {
    /// Store a named value, replacing any previous one
    pub fn set<T: Any + Send>(&mut self, name: impl Into<String>, value: T) {
        self.values.insert(name.into(), Box::new(value));
    }

    /// Named value, if present and of type `T`
    pub fn get<T: Any>(&self, name: &str) -> Option<&T> {
        self.values.get(name).and_then(|value| value.downcast_ref())
    }

    /// Remove a named value
    pub fn remove(&mut self, name: &str) -> bool {
        self.values.remove(name).is_some()
    }

    /// Clear values and overrides
    pub fn reset(&mut self) {
        self.compute_groups = [0; 3];
        self.values.clear();
    }
}

/// Recording state of a queue's current batch
#[derive(Debug, Default)]
pub struct BatchDrawInfo {
    /// Whether `begin` has been called without a matching `end`
    pub began: bool,
    /// Values shared between passes
    pub custom: CustomDrawInfo,
}

impl BatchDrawInfo {
    pub(crate) fn reset(&mut self) {
        self.began = false;
        self.custom.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_values() {
        let mut info = CustomDrawInfo::default();
        info.set("exposure", 1.5f32);
        assert_eq!(info.get::<f32>("exposure"), Some(&1.5));
        assert_eq!(info.get::<u32>("exposure"), None);
        assert!(info.remove("exposure"));
        assert!(!info.remove("exposure"));
    }

    #[test]
    fn test_reset_clears_overrides() {
        let mut batch = BatchDrawInfo { began: true, ..BatchDrawInfo::default() };
        batch.custom.compute_groups = [4, 1, 1];
        batch.custom.set("pass", 2u32);
        batch.reset();
        assert!(!batch.began);
        assert_eq!(batch.custom.compute_groups, [0; 3]);
        assert!(batch.custom.get::<u32>("pass").is_none());
    }
}
