mod registry;
mod selectors;

pub use registry::{CapabilityLimits, ModelCandidate, ModelRegistry, RegistryError, TaskModels};
pub use selectors::{ModelSelection, ModelSelector};
