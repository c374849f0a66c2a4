//! JSON wire messages exchanged with the live service
//!
//! Two framings are spoken. The `media` dialect tags base64 audio with an
//! encoding string of the form `audio/pcm;rate=<hz>` and treats binary
//! frames as raw PCM. The `gemini` dialect follows the Gemini Live
//! `BidiGenerateContent` messages, which arrive as JSON in either frame type.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use super::SessionConfig;
use crate::audio::{AudioFrame, Direction, WIRE_OUTPUT_RATE};
use crate::{Error, Result};

/// Modality requested for replies
pub const RESPONSE_MODALITY: &str = "AUDIO";

/// Host serving the Gemini Live API
const GEMINI_HOST: &str = "generativelanguage.googleapis.com";

/// Messages received from the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    /// The user talked over the reply; queued playback must stop
    Interrupted,
    /// A chunk of synthesized speech
    Audio(AudioFrame),
}

/// Message framing spoken on the channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// `setup` / `media` / `audio` messages
    #[default]
    Media,
    /// Gemini Live `setup` / `realtimeInput` / `serverContent` messages
    Gemini,
}

impl Dialect {
    /// Dialect implied by an endpoint when none is configured
    #[must_use]
    pub fn for_endpoint(endpoint: &str) -> Self {
        let is_gemini = url::Url::parse(endpoint)
            .ok()
            .and_then(|url| url.host_str().map(|h| h.eq_ignore_ascii_case(GEMINI_HOST)))
            .unwrap_or(false);
        if is_gemini { Self::Gemini } else { Self::Media }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Media => write!(f, "media"),
            Self::Gemini => write!(f, "gemini"),
        }
    }
}

impl FromStr for Dialect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "media" => Ok(Self::Media),
            "gemini" => Ok(Self::Gemini),
            other => Err(Error::Config(format!("unknown wire dialect: {other}"))),
        }
    }
}

// Media dialect

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaSetup<'a> {
    model: &'a str,
    response_modalities: [&'a str; 1],
    system_instruction: &'a str,
    voice: &'a str,
}

#[derive(Debug, Serialize)]
struct Media<'a> {
    encoding: &'a str,
    bytes: String,
}

// Gemini dialect

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiSetup<'a> {
    model: String,
    generation_config: GenerationConfig<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: [&'a str; 1],
    speech_config: SpeechConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig<'a> {
    prebuilt_voice_config: PrebuiltVoice<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoice<'a> {
    voice_name: &'a str,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput<'a> {
    media_chunks: [Blob<'a>; 1],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Blob<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum Outbound<'a> {
    Setup(MediaSetup<'a>),
    Media(Media<'a>),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum GeminiOutbound<'a> {
    Setup(GeminiSetup<'a>),
    RealtimeInput(RealtimeInput<'a>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInbound {
    #[serde(default)]
    interrupted: bool,
    audio: Option<RawAudio>,
    server_content: Option<ServerContent>,
}

#[derive(Debug, Deserialize)]
struct RawAudio {
    #[serde(default)]
    encoding: Option<String>,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    interrupted: bool,
    model_turn: Option<ModelTurn>,
}

#[derive(Debug, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: Option<String>,
    data: String,
}

/// Encoding tag for PCM at `sample_rate`
#[must_use]
pub fn pcm_encoding(sample_rate: u32) -> String {
    format!("audio/pcm;rate={sample_rate}")
}

/// Extract the sample rate from an `audio/pcm;rate=<hz>` tag
#[must_use]
pub fn parse_pcm_rate(encoding: &str) -> Option<u32> {
    let mut parts = encoding.split(';').map(str::trim);
    if !parts.next()?.eq_ignore_ascii_case("audio/pcm") {
        return None;
    }
    parts
        .filter_map(|p| p.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("rate"))
        .and_then(|(_, v)| v.trim().parse().ok())
}

fn is_pcm(encoding: &str) -> bool {
    encoding
        .split(';')
        .next()
        .is_some_and(|base| base.trim().eq_ignore_ascii_case("audio/pcm"))
}

/// Rate of inbound audio; an untagged or rate-less payload is 24 kHz
fn inbound_rate(encoding: Option<&str>) -> Result<u32> {
    match encoding {
        None => Ok(WIRE_OUTPUT_RATE),
        Some(e) if is_pcm(e) => Ok(parse_pcm_rate(e).unwrap_or(WIRE_OUTPUT_RATE)),
        Some(e) => Err(Error::Protocol(format!("unsupported audio encoding: {e}"))),
    }
}

fn inbound_audio(encoding: Option<&str>, data: &str) -> Result<InboundMessage> {
    let sample_rate = inbound_rate(encoding)?;
    let pcm = BASE64
        .decode(data.as_bytes())
        .map_err(|e| Error::Protocol(format!("invalid audio payload: {e}")))?;

    Ok(InboundMessage::Audio(AudioFrame {
        direction: Direction::Inbound,
        sample_rate,
        pcm,
    }))
}

/// Serialize the setup frame that opens a session
///
/// # Errors
///
/// Returns error if serialization fails
pub fn encode_setup(dialect: Dialect, config: &SessionConfig) -> Result<String> {
    let json = match dialect {
        Dialect::Media => serde_json::to_string(&Outbound::Setup(MediaSetup {
            model: &config.model,
            response_modalities: [RESPONSE_MODALITY],
            system_instruction: &config.system_instruction,
            voice: &config.voice,
        }))?,
        Dialect::Gemini => {
            let model = if config.model.starts_with("models/") {
                config.model.clone()
            } else {
                format!("models/{}", config.model)
            };
            let instruction = config.system_instruction.trim();
            serde_json::to_string(&GeminiOutbound::Setup(GeminiSetup {
                model,
                generation_config: GenerationConfig {
                    response_modalities: [RESPONSE_MODALITY],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoice {
                                voice_name: &config.voice,
                            },
                        },
                    },
                },
                system_instruction: (!instruction.is_empty()).then_some(Content {
                    parts: [TextPart { text: instruction }],
                }),
            }))?
        }
    };
    Ok(json)
}

/// Serialize an outbound audio frame
///
/// # Errors
///
/// Returns error if serialization fails
pub fn encode_media(dialect: Dialect, frame: &AudioFrame) -> Result<String> {
    let encoding = pcm_encoding(frame.sample_rate);
    let bytes = BASE64.encode(&frame.pcm);
    let json = match dialect {
        Dialect::Media => serde_json::to_string(&Outbound::Media(Media {
            encoding: &encoding,
            bytes,
        }))?,
        Dialect::Gemini => serde_json::to_string(&GeminiOutbound::RealtimeInput(RealtimeInput {
            media_chunks: [Blob {
                mime_type: &encoding,
                data: bytes,
            }],
        }))?,
    };
    Ok(json)
}

/// Parse a JSON message from the service
///
/// Both dialects are understood. Messages carrying neither audio nor an
/// interruption yield nothing; an interruption is reported before any audio
/// in the same message.
///
/// # Errors
///
/// Returns error if the message is not valid JSON or an audio payload is
/// malformed
pub fn decode_text(text: &str) -> Result<Vec<InboundMessage>> {
    let raw: RawInbound = serde_json::from_str(text)?;
    let mut messages = Vec::new();

    let content_interrupted = raw.server_content.as_ref().is_some_and(|c| c.interrupted);
    if raw.interrupted || content_interrupted {
        messages.push(InboundMessage::Interrupted);
    }

    if let Some(audio) = raw.audio {
        messages.push(inbound_audio(audio.encoding.as_deref(), &audio.data)?);
    }

    let parts = raw
        .server_content
        .and_then(|c| c.model_turn)
        .map(|turn| turn.parts)
        .unwrap_or_default();
    for inline in parts.into_iter().filter_map(|p| p.inline_data) {
        let mime = inline.mime_type.as_deref();
        if mime.is_some_and(|m| !is_pcm(m)) {
            continue;
        }
        messages.push(inbound_audio(mime, &inline.data)?);
    }

    Ok(messages)
}

/// Interpret a binary frame from the service
///
/// The media dialect sends raw 24 kHz PCM; the Gemini dialect sends JSON.
///
/// # Errors
///
/// Returns error if a Gemini frame is not UTF-8 JSON
pub fn decode_binary(dialect: Dialect, data: Vec<u8>) -> Result<Vec<InboundMessage>> {
    match dialect {
        Dialect::Media => Ok(vec![InboundMessage::Audio(AudioFrame {
            direction: Direction::Inbound,
            sample_rate: WIRE_OUTPUT_RATE,
            pcm: data,
        })]),
        Dialect::Gemini => {
            let text = String::from_utf8(data)
                .map_err(|e| Error::Protocol(format!("binary frame is not UTF-8: {e}")))?;
            decode_text(&text)
        }
    }
}
