use super::registry::{ModelCandidate, ModelRegistry, RegistryError};
use crate::tasks::TaskKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    /// Attempt order: the leader first, then the remaining fallbacks in table order.
    pub candidates: Vec<ModelCandidate>,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

impl ModelSelection {
    pub fn leader(&self) -> &ModelCandidate {
        &self.candidates[0]
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_default(),
        }
    }

    pub fn resolve(
        &self,
        task: TaskKind,
        requested: Option<&str>,
        capability: Option<&str>,
    ) -> Result<ModelSelection, RegistryError> {
        let eligible: Vec<ModelCandidate> = self
            .registry
            .candidates(task)
            .into_iter()
            .filter(|model| model.supports(capability))
            .collect();
        if eligible.is_empty() {
            return Err(RegistryError::NoCandidates {
                task,
                capability: capability.unwrap_or(task.as_str()).to_string(),
            });
        }

        let requested = requested
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let requested_match = requested.and_then(|key| {
            eligible
                .iter()
                .position(|model| model.matches(key))
        });

        let (leader_idx, fallback_reason) = match requested_match {
            Some(idx) => (idx, None),
            None => {
                let default_idx = self
                    .registry
                    .default_candidate(task)
                    .and_then(|default| {
                        eligible
                            .iter()
                            .position(|model| model.alias == default.alias)
                    })
                    .unwrap_or(0);
                let leader = &eligible[default_idx].alias;
                let reason = match requested {
                    Some(key) => format!(
                        "Requested model '{key}' unavailable for '{task}'; using default '{leader}'."
                    ),
                    None => format!("No model specified; using default '{leader}'."),
                };
                (default_idx, Some(reason))
            }
        };

        let mut candidates = Vec::with_capacity(eligible.len());
        candidates.push(eligible[leader_idx].clone());
        candidates.extend(
            eligible
                .into_iter()
                .enumerate()
                .filter(|(idx, _)| *idx != leader_idx)
                .map(|(_, model)| model),
        );

        Ok(ModelSelection {
            candidates,
            requested: requested.map(str::to_string),
            fallback_reason,
        })
    }
}
