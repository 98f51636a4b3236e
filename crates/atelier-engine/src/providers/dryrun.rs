use std::io::Cursor;

use async_trait::async_trait;
use atelier_contracts::outcome::ProviderFailure;
use atelier_contracts::requests::{GenerationParams, Payload};
use atelier_contracts::{TaskKind, VisionOp};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::json;
use sha2::{Digest, Sha256};

use super::{InferenceProvider, ProviderCall, ProviderReply};

const DRYRUN_SAMPLE_RATE: u32 = 16_000;

/// Offline deterministic provider. Needs no key; output depends only on the call.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunProvider;

#[async_trait]
impl InferenceProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    async fn invoke(&self, call: &ProviderCall<'_>) -> Result<ProviderReply, ProviderFailure> {
        match (call.task, call.payload) {
            (TaskKind::TextGeneration, Payload::Prompt { text }) => Ok(ProviderReply::Json(json!([{
                "generated_text": format!("[dryrun {}] {}", short_id(text), text),
            }]))),
            (TaskKind::Chat, Payload::Chat { messages }) => {
                let last = messages
                    .iter()
                    .rev()
                    .find(|message| message.role == "user")
                    .map(|message| message.content.as_str())
                    .unwrap_or_default();
                Ok(ProviderReply::Json(json!({
                    "model": call.backend_id,
                    "choices": [{
                        "message": {
                            "role": "assistant",
                            "content": format!("[dryrun {}] {}", short_id(last), last),
                        }
                    }]
                })))
            }
            (TaskKind::ImageGeneration, Payload::Prompt { text }) => Ok(ProviderReply::Binary {
                bytes: render_png(&call.params, text)?,
                mime: "image/png".to_string(),
            }),
            (TaskKind::TextToSpeech, Payload::Prompt { .. }) => Ok(ProviderReply::Binary {
                bytes: silent_wav(DRYRUN_SAMPLE_RATE / 2),
                mime: "audio/wav".to_string(),
            }),
            (TaskKind::SpeechToText, Payload::Audio { bytes, .. }) => Ok(ProviderReply::Json(json!({
                "text": format!("dryrun transcript of {} bytes", bytes.len()),
            }))),
            (TaskKind::VisionTask, Payload::Image { op, question, .. }) => {
                let result = match op {
                    VisionOp::Caption => json!([{ "generated_text": "a dryrun placeholder image" }]),
                    VisionOp::Classify => json!([{ "label": "dryrun", "score": 1.0 }]),
                    VisionOp::Detect => json!([]),
                    VisionOp::QuestionAnswering => json!([{
                        "answer": format!("dryrun answer to: {}", question.as_deref().unwrap_or_default()),
                        "score": 1.0,
                    }]),
                };
                Ok(ProviderReply::Json(result))
            }
            (task, _) => Err(ProviderFailure::fatal(format!(
                "payload does not match task '{task}'"
            ))),
        }
    }
}

fn render_png(params: &GenerationParams, prompt: &str) -> Result<Vec<u8>, ProviderFailure> {
    let (r, g, b) = color_from_prompt(prompt);
    let image = RgbImage::from_pixel(params.width, params.height, Rgb([r, g, b]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|err| ProviderFailure::fatal(format!("dryrun PNG encode failed: {err}")))?;
    Ok(bytes)
}

/// 16-bit mono PCM WAV of `samples` zero samples.
fn silent_wav(samples: u32) -> Vec<u8> {
    let data_len = samples * 2;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVEfmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&DRYRUN_SAMPLE_RATE.to_le_bytes());
    out.extend_from_slice(&(DRYRUN_SAMPLE_RATE * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.resize(44 + data_len as usize, 0);
    out
}

fn color_from_prompt(prompt: &str) -> (u8, u8, u8) {
    let digest = Sha256::digest(prompt.as_bytes());
    (digest[0], digest[1], digest[2])
}

fn short_id(prompt: &str) -> String {
    let digest = Sha256::digest(prompt.as_bytes());
    hex::encode(&digest[..4])
}
