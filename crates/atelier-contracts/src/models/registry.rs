use indexmap::IndexMap;
use serde::Serialize;
use thiserror::Error;

use crate::tasks::TaskKind;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl CapabilityLimits {
    pub fn image(max_side: u32) -> Self {
        Self {
            max_width: Some(max_side),
            max_height: Some(max_side),
            max_tokens: None,
        }
    }

    pub fn tokens(max_tokens: u32) -> Self {
        Self {
            max_tokens: Some(max_tokens),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCandidate {
    pub alias: String,
    pub backend_id: String,
    pub provider: String,
    pub limits: CapabilityLimits,
    /// Sub-capabilities (vision ops). Empty means the candidate serves every request of its task.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

impl ModelCandidate {
    pub fn supports(&self, capability: Option<&str>) -> bool {
        match capability {
            None => true,
            Some(_) if self.capabilities.is_empty() => true,
            Some(wanted) => self.capabilities.iter().any(|item| item == wanted),
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        self.alias.eq_ignore_ascii_case(key) || self.backend_id.eq_ignore_ascii_case(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskModels {
    pub default_alias: String,
    pub candidates: IndexMap<String, ModelCandidate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no model table configured for task '{0}'")]
    MissingTable(TaskKind),
    #[error("model table for task '{0}' is empty")]
    EmptyTable(TaskKind),
    #[error("default alias '{alias}' for task '{task}' is not in its model table")]
    UnknownDefault { task: TaskKind, alias: String },
    #[error("no models available for task '{task}' with capability '{capability}'")]
    NoCandidates { task: TaskKind, capability: String },
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    tasks: IndexMap<TaskKind, TaskModels>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ModelRegistry {
    pub fn new(tasks: Option<IndexMap<TaskKind, TaskModels>>) -> Self {
        Self {
            tasks: tasks.unwrap_or_else(default_models),
        }
    }

    /// Checks that every task kind has a non-empty table whose default is present.
    pub fn validate(&self) -> Result<(), RegistryError> {
        for task in TaskKind::ALL {
            let table = self.tasks.get(&task).ok_or(RegistryError::MissingTable(task))?;
            if table.candidates.is_empty() {
                return Err(RegistryError::EmptyTable(task));
            }
            if !table.candidates.contains_key(&table.default_alias) {
                return Err(RegistryError::UnknownDefault {
                    task,
                    alias: table.default_alias.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn get(&self, task: TaskKind, key: &str) -> Option<&ModelCandidate> {
        let table = self.tasks.get(&task)?;
        let key = key.trim();
        table
            .candidates
            .get(key)
            .or_else(|| table.candidates.values().find(|model| model.matches(key)))
    }

    pub fn candidates(&self, task: TaskKind) -> Vec<ModelCandidate> {
        self.tasks
            .get(&task)
            .map(|table| table.candidates.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn default_candidate(&self, task: TaskKind) -> Option<&ModelCandidate> {
        let table = self.tasks.get(&task)?;
        table.candidates.get(&table.default_alias)
    }

    pub fn aliases(&self, task: TaskKind) -> Vec<String> {
        self.tasks
            .get(&task)
            .map(|table| table.candidates.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn tasks(&self) -> impl Iterator<Item = (&TaskKind, &TaskModels)> {
        self.tasks.iter()
    }
}

fn default_models() -> IndexMap<TaskKind, TaskModels> {
    let mut tasks = IndexMap::new();

    let mut insert = |task: TaskKind,
                      default_alias: &str,
                      rows: &[(&str, &str, &str, CapabilityLimits, &[&str])]| {
        let mut candidates = IndexMap::new();
        for (alias, backend_id, provider, limits, capabilities) in rows {
            candidates.insert(
                (*alias).to_string(),
                ModelCandidate {
                    alias: (*alias).to_string(),
                    backend_id: (*backend_id).to_string(),
                    provider: (*provider).to_string(),
                    limits: *limits,
                    capabilities: capabilities.iter().map(|item| (*item).to_string()).collect(),
                },
            );
        }
        tasks.insert(
            task,
            TaskModels {
                default_alias: default_alias.to_string(),
                candidates,
            },
        );
    };

    insert(
        TaskKind::TextGeneration,
        "mistral",
        &[
            (
                "mistral",
                "mistralai/Mistral-7B-Instruct-v0.2",
                "huggingface",
                CapabilityLimits::tokens(1024),
                &[],
            ),
            (
                "zephyr",
                "HuggingFaceH4/zephyr-7b-beta",
                "huggingface",
                CapabilityLimits::tokens(1024),
                &[],
            ),
            (
                "phi",
                "microsoft/phi-2",
                "huggingface",
                CapabilityLimits::tokens(512),
                &[],
            ),
            (
                "gemma",
                "google/gemma-2b-it",
                "huggingface",
                CapabilityLimits::tokens(512),
                &[],
            ),
        ],
    );
    insert(
        TaskKind::ImageGeneration,
        "sdxl",
        &[
            (
                "sdxl",
                "stabilityai/stable-diffusion-xl-base-1.0",
                "huggingface",
                CapabilityLimits::image(1024),
                &[],
            ),
            (
                "sd-2-1",
                "stabilityai/stable-diffusion-2-1",
                "huggingface",
                CapabilityLimits::image(768),
                &[],
            ),
            (
                "openjourney",
                "prompthero/openjourney",
                "huggingface",
                CapabilityLimits::image(512),
                &[],
            ),
        ],
    );
    insert(
        TaskKind::SpeechToText,
        "whisper",
        &[
            (
                "whisper",
                "openai/whisper-large-v3",
                "huggingface",
                CapabilityLimits::default(),
                &[],
            ),
            (
                "whisper-base",
                "openai/whisper-base",
                "huggingface",
                CapabilityLimits::default(),
                &[],
            ),
            (
                "wav2vec2",
                "facebook/wav2vec2-base-960h",
                "huggingface",
                CapabilityLimits::default(),
                &[],
            ),
        ],
    );
    insert(
        TaskKind::TextToSpeech,
        "mms-tts",
        &[
            (
                "mms-tts",
                "facebook/mms-tts-eng",
                "huggingface",
                CapabilityLimits::default(),
                &[],
            ),
            (
                "speecht5",
                "microsoft/speecht5_tts",
                "huggingface",
                CapabilityLimits::default(),
                &[],
            ),
            (
                "bark-small",
                "suno/bark-small",
                "huggingface",
                CapabilityLimits::default(),
                &[],
            ),
        ],
    );
    insert(
        TaskKind::VisionTask,
        "blip",
        &[
            (
                "blip",
                "Salesforce/blip-image-captioning-large",
                "huggingface",
                CapabilityLimits::default(),
                &["caption"],
            ),
            (
                "vit-gpt2",
                "nlpconnect/vit-gpt2-image-captioning",
                "huggingface",
                CapabilityLimits::default(),
                &["caption"],
            ),
            (
                "vit",
                "google/vit-base-patch16-224",
                "huggingface",
                CapabilityLimits::default(),
                &["classify"],
            ),
            (
                "detr",
                "facebook/detr-resnet-50",
                "huggingface",
                CapabilityLimits::default(),
                &["detect"],
            ),
            (
                "vilt",
                "dandelin/vilt-b32-finetuned-vqa",
                "huggingface",
                CapabilityLimits::default(),
                &["question-answering"],
            ),
        ],
    );
    insert(
        TaskKind::Chat,
        "llama",
        &[
            (
                "llama",
                "meta-llama/llama-3.1-8b-instruct:free",
                "openrouter",
                CapabilityLimits::tokens(4096),
                &[],
            ),
            (
                "mistral",
                "mistralai/mistral-7b-instruct:free",
                "openrouter",
                CapabilityLimits::tokens(4096),
                &[],
            ),
            (
                "gemma",
                "google/gemma-2-9b-it:free",
                "openrouter",
                CapabilityLimits::tokens(2048),
                &[],
            ),
        ],
    );

    tasks
}
