//! Persona configuration
//!
//! A subset of the persona.json document: identity, the synthesized voice
//! and the instructions sent when a live session is set up.
//! See: <https://persona.omni.dev>

use serde::{Deserialize, Serialize};

/// A persona defines who the remote service speaks as
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    /// Schema URL (optional, for validation)
    #[serde(rename = "$schema")]
    pub schema: Option<String>,

    /// Semantic version of this persona file
    pub version: String,

    /// Core identity (required)
    pub identity: Identity,

    /// Voice configuration
    pub voice: Option<Voice>,

    /// Behavior and communication style
    pub personality: Option<Personality>,
}

/// Core identity of the entity
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Unique identifier
    pub id: String,

    /// Display name
    pub name: String,

    /// Short descriptive phrase
    pub tagline: Option<String>,

    /// Entity type classification
    #[serde(rename = "type")]
    pub entity_type: Option<EntityType>,
}

/// Entity type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Assistant,
    Brand,
    Bot,
    Character,
    Mascot,
    Service,
}

/// Voice configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Voice {
    /// Speech synthesis settings
    pub tts: Option<TtsConfig>,
}

/// Speech synthesis settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TtsConfig {
    /// Prebuilt voice name
    pub voice: Option<String>,
}

/// Behavior and communication style
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Personality {
    /// Base system prompt
    pub system_prompt: Option<String>,

    /// Default communication tone
    pub tone: Option<String>,

    /// Mode-specific guidelines
    pub guidelines: Option<PersonalityGuidelines>,
}

/// Mode-specific behavior guidelines
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonalityGuidelines {
    /// Additional instructions for voice interactions
    pub voice: Option<String>,

    /// Additional instructions for text interactions
    pub text: Option<String>,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            schema: None,
            version: "1.0.0".to_string(),
            identity: Identity {
                id: "assistant".to_string(),
                name: "Assistant".to_string(),
                tagline: None,
                entity_type: Some(EntityType::Assistant),
            },
            voice: None,
            personality: None,
        }
    }
}

impl Persona {
    /// Get the unique identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.identity.id
    }

    /// Get the display name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    /// Get the system prompt
    #[must_use]
    pub fn system_prompt(&self) -> Option<&str> {
        self.personality.as_ref()?.system_prompt.as_deref()
    }

    /// Get the extra instructions for spoken conversations
    #[must_use]
    pub fn voice_guidelines(&self) -> Option<&str> {
        self.personality
            .as_ref()?
            .guidelines
            .as_ref()?
            .voice
            .as_deref()
    }

    /// Get the synthesized voice name
    #[must_use]
    pub fn voice_name(&self) -> Option<&str> {
        self.voice.as_ref()?.tts.as_ref()?.voice.as_deref()
    }

    /// Instruction text sent when a session is set up
    ///
    /// The system prompt followed by the voice guidelines, separated by a
    /// blank line. Either part may be absent.
    #[must_use]
    pub fn session_instruction(&self) -> String {
        [self.system_prompt(), self.voice_guidelines()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}
