//! Process configuration (C8, spec §4.5): the static, startup-time-frozen
//! graph of steps a `ProcessConfiguration` declares.
//!
//! Grounded on the Command Handler Registry's immutable-after-startup shape
//! (`HandlerRegistry`) — a `ProcessConfiguration` is the equivalent frozen
//! map for process types, just as spec §5 calls out "the process
//! configuration registry is immutable after startup" alongside the handler
//! registry.

use std::collections::HashMap;

use crate::error::ConfigurationError;

/// How a completed step picks its successor (spec §4.5 "Advance algorithm").
#[derive(Debug, Clone)]
pub enum NextStepStrategy {
    Direct { next_step: String },
    Conditional { branches: Vec<(String, String)>, default_step: String },
    Terminal,
    Parallel { branches: Vec<String>, join_step: String },
}

#[derive(Debug, Clone)]
pub struct ProcessStep {
    pub name: String,
    /// The command type scheduled via the Command Bus when this step runs.
    pub command_type: String,
    /// The command type scheduled to undo this step during compensation, if any.
    pub compensation_command_type: Option<String>,
    pub next_step_strategy: NextStepStrategy,
}

#[derive(Debug, Clone)]
pub struct ProcessConfiguration {
    pub process_type: String,
    pub start_step: String,
    pub steps: HashMap<String, ProcessStep>,
}

impl ProcessConfiguration {
    pub fn step(&self, name: &str) -> Option<&ProcessStep> {
        self.steps.get(name)
    }
}

/// Immutable-after-startup map from process type name to its configuration.
pub struct ProcessRegistry {
    configs: HashMap<String, ProcessConfiguration>,
}

pub struct ProcessRegistryBuilder {
    configs: HashMap<String, ProcessConfiguration>,
}

impl ProcessRegistryBuilder {
    pub fn new() -> Self {
        Self {
            configs: HashMap::new(),
        }
    }

    /// Registering two configurations for the same process type is a fatal
    /// configuration error (spec §7), mirroring `HandlerRegistry::register`.
    pub fn register(mut self, config: ProcessConfiguration) -> Result<Self, ConfigurationError> {
        if self.configs.contains_key(&config.process_type) {
            return Err(ConfigurationError::DuplicateProcessType(config.process_type));
        }
        self.configs.insert(config.process_type.clone(), config);
        Ok(self)
    }

    pub fn build(self) -> ProcessRegistry {
        ProcessRegistry {
            configs: self.configs,
        }
    }
}

impl ProcessRegistry {
    pub fn builder() -> ProcessRegistryBuilder {
        ProcessRegistryBuilder::new()
    }

    pub fn get(&self, process_type: &str) -> Option<&ProcessConfiguration> {
        self.configs.get(process_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(process_type: &str) -> ProcessConfiguration {
        ProcessConfiguration {
            process_type: process_type.to_string(),
            start_step: "step_a".to_string(),
            steps: HashMap::new(),
        }
    }

    #[test]
    fn duplicate_process_type_is_a_configuration_error() {
        let result = ProcessRegistry::builder()
            .register(sample("Onboarding"))
            .unwrap()
            .register(sample("Onboarding"));

        assert!(matches!(
            result,
            Err(ConfigurationError::DuplicateProcessType(ref t)) if t == "Onboarding"
        ));
    }
}
