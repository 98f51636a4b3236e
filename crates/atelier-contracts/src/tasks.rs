use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    TextGeneration,
    ImageGeneration,
    SpeechToText,
    TextToSpeech,
    VisionTask,
    Chat,
}

impl TaskKind {
    pub const ALL: [TaskKind; 6] = [
        TaskKind::TextGeneration,
        TaskKind::ImageGeneration,
        TaskKind::SpeechToText,
        TaskKind::TextToSpeech,
        TaskKind::VisionTask,
        TaskKind::Chat,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::TextGeneration => "text-generation",
            TaskKind::ImageGeneration => "image-generation",
            TaskKind::SpeechToText => "speech-to-text",
            TaskKind::TextToSpeech => "text-to-speech",
            TaskKind::VisionTask => "vision-task",
            TaskKind::Chat => "chat",
        }
    }

    /// Name of the payload field that carries the result in the success envelope.
    pub fn output_field(self) -> &'static str {
        match self {
            TaskKind::TextGeneration | TaskKind::SpeechToText | TaskKind::Chat => "text",
            TaskKind::ImageGeneration => "image",
            TaskKind::TextToSpeech => "audio",
            TaskKind::VisionTask => "result",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('_', "-");
        TaskKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| {
                let valid = TaskKind::ALL
                    .iter()
                    .map(|kind| kind.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("Unknown task kind '{raw}' (expected one of: {valid}).")
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VisionOp {
    #[default]
    Caption,
    Classify,
    Detect,
    QuestionAnswering,
}

impl VisionOp {
    pub fn as_str(self) -> &'static str {
        match self {
            VisionOp::Caption => "caption",
            VisionOp::Classify => "classify",
            VisionOp::Detect => "detect",
            VisionOp::QuestionAnswering => "question-answering",
        }
    }
}

impl FromStr for VisionOp {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "" | "caption" | "image-to-text" | "captioning" => Ok(VisionOp::Caption),
            "classify" | "classification" | "image-classification" => Ok(VisionOp::Classify),
            "detect" | "detection" | "object-detection" => Ok(VisionOp::Detect),
            "question-answering" | "vqa" | "visual-question-answering" => {
                Ok(VisionOp::QuestionAnswering)
            }
            other => Err(format!(
                "Unknown vision task '{other}' (expected caption, classify, detect or question-answering)."
            )),
        }
    }
}
