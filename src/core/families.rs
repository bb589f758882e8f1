//! Model family classification.
//!
//! Every quota, routing, and key-selection decision in the proxy operates on
//! a coarse model *family* rather than on raw model ids. Classification is a
//! pure function over `(service, model id)`: per-service ordered regex tables
//! are matched top to bottom and the first match wins. Unknown ids fall back
//! to the service default with a warning, never an error.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Upstream service a key or request is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Service {
    Openai,
    Anthropic,
    GooglePalm,
    Aws,
    Mistral,
}

impl Service {
    /// Short tag used as the prefix of key hashes.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            Service::Openai => "oai",
            Service::Anthropic => "ant",
            Service::GooglePalm => "goo",
            Service::Aws => "aws",
            Service::Mistral => "mis",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Openai => "openai",
            Service::Anthropic => "anthropic",
            Service::GooglePalm => "google-palm",
            Service::Aws => "aws",
            Service::Mistral => "mistral",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse model-capability tag used as the unit of quota and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelFamily {
    #[serde(rename = "turbo")]
    Turbo,
    #[serde(rename = "gpt4")]
    Gpt4,
    #[serde(rename = "gpt4-32k")]
    Gpt4_32k,
    #[serde(rename = "gpt4-turbo")]
    Gpt4Turbo,
    #[serde(rename = "dall-e")]
    DallE,
    #[serde(rename = "claude")]
    Claude,
    #[serde(rename = "bison")]
    Bison,
    #[serde(rename = "aws-claude")]
    AwsClaude,
    #[serde(rename = "mistral-tiny")]
    MistralTiny,
    #[serde(rename = "mistral-small")]
    MistralSmall,
    #[serde(rename = "mistral-medium")]
    MistralMedium,
    #[serde(rename = "mistral-large")]
    MistralLarge,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 12] = [
        ModelFamily::Turbo,
        ModelFamily::Gpt4,
        ModelFamily::Gpt4_32k,
        ModelFamily::Gpt4Turbo,
        ModelFamily::DallE,
        ModelFamily::Claude,
        ModelFamily::Bison,
        ModelFamily::AwsClaude,
        ModelFamily::MistralTiny,
        ModelFamily::MistralSmall,
        ModelFamily::MistralMedium,
        ModelFamily::MistralLarge,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelFamily::Turbo => "turbo",
            ModelFamily::Gpt4 => "gpt4",
            ModelFamily::Gpt4_32k => "gpt4-32k",
            ModelFamily::Gpt4Turbo => "gpt4-turbo",
            ModelFamily::DallE => "dall-e",
            ModelFamily::Claude => "claude",
            ModelFamily::Bison => "bison",
            ModelFamily::AwsClaude => "aws-claude",
            ModelFamily::MistralTiny => "mistral-tiny",
            ModelFamily::MistralSmall => "mistral-small",
            ModelFamily::MistralMedium => "mistral-medium",
            ModelFamily::MistralLarge => "mistral-large",
        }
    }

    /// The service whose keys serve this family.
    pub fn service(&self) -> Service {
        match self {
            ModelFamily::Turbo
            | ModelFamily::Gpt4
            | ModelFamily::Gpt4_32k
            | ModelFamily::Gpt4Turbo
            | ModelFamily::DallE => Service::Openai,
            ModelFamily::Claude => Service::Anthropic,
            ModelFamily::Bison => Service::GooglePalm,
            ModelFamily::AwsClaude => Service::Aws,
            ModelFamily::MistralTiny
            | ModelFamily::MistralSmall
            | ModelFamily::MistralMedium
            | ModelFamily::MistralLarge => Service::Mistral,
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelFamily::ALL
            .iter()
            .find(|f| f.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown model family: {}", s))
    }
}

// Ordered: first match wins. gpt-4-turbo variants must be tested before the
// bare gpt-4 prefix, and 32k before the base family.
static OPENAI_FAMILY_TABLE: Lazy<Vec<(Regex, ModelFamily)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"^gpt-4-turbo(-preview)?$|^gpt-4-(0125|1106)(-preview)?$|^gpt-4(-\d{4})?-vision(-preview)?$")
                .unwrap(),
            ModelFamily::Gpt4Turbo,
        ),
        (Regex::new(r"^gpt-4-32k").unwrap(), ModelFamily::Gpt4_32k),
        (Regex::new(r"^gpt-4").unwrap(), ModelFamily::Gpt4),
        (Regex::new(r"^gpt-3\.5-turbo").unwrap(), ModelFamily::Turbo),
        (Regex::new(r"^text-embedding").unwrap(), ModelFamily::Turbo),
        (Regex::new(r"^dall-e").unwrap(), ModelFamily::DallE),
    ]
});

static BISON_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\w+-bison-\d{3}$").unwrap());

static MISTRAL_FAMILY_TABLE: Lazy<Vec<(&'static str, ModelFamily)>> = Lazy::new(|| {
    vec![
        ("open-mistral-7b", ModelFamily::MistralTiny),
        ("mistral-tiny", ModelFamily::MistralTiny),
        ("open-mixtral-8x7b", ModelFamily::MistralSmall),
        ("mistral-small", ModelFamily::MistralSmall),
        ("mistral-medium", ModelFamily::MistralMedium),
        ("mistral-large", ModelFamily::MistralLarge),
    ]
});

/// Classify a model id into its family for the given service.
///
/// Never fails: ids that match no table entry are assigned the service
/// default and logged at warn level.
pub fn classify(service: Service, model: &str) -> ModelFamily {
    match service {
        Service::Openai => {
            for (pattern, family) in OPENAI_FAMILY_TABLE.iter() {
                if pattern.is_match(model) {
                    return *family;
                }
            }
            tracing::warn!(model, "unrecognized OpenAI model, assuming turbo");
            ModelFamily::Turbo
        }
        Service::Anthropic => {
            // Bedrock-hosted Claude models come in with the vendor prefix.
            if model.starts_with("anthropic.") {
                ModelFamily::AwsClaude
            } else {
                ModelFamily::Claude
            }
        }
        Service::GooglePalm => {
            if BISON_PATTERN.is_match(model) {
                ModelFamily::Bison
            } else {
                tracing::warn!(model, "unrecognized PaLM model, assuming bison");
                ModelFamily::Bison
            }
        }
        Service::Aws => ModelFamily::AwsClaude,
        Service::Mistral => {
            for (prefix, family) in MISTRAL_FAMILY_TABLE.iter() {
                if model.starts_with(prefix) {
                    return *family;
                }
            }
            tracing::warn!(model, "unrecognized Mistral model, assuming mistral-tiny");
            ModelFamily::MistralTiny
        }
    }
}

/// Representative model ids advertised for a family on `/v1/models`.
pub fn models_for_family(family: ModelFamily) -> &'static [&'static str] {
    match family {
        ModelFamily::Turbo => &["gpt-3.5-turbo", "gpt-3.5-turbo-1106", "gpt-3.5-turbo-instruct"],
        ModelFamily::Gpt4 => &["gpt-4", "gpt-4-0613"],
        ModelFamily::Gpt4_32k => &["gpt-4-32k", "gpt-4-32k-0613"],
        ModelFamily::Gpt4Turbo => &["gpt-4-turbo-preview", "gpt-4-1106-preview", "gpt-4-0125-preview"],
        ModelFamily::DallE => &["dall-e-2", "dall-e-3"],
        ModelFamily::Claude => &["claude-instant-v1", "claude-v2", "claude-2.1"],
        ModelFamily::Bison => &["text-bison-001", "chat-bison-001"],
        ModelFamily::AwsClaude => &["anthropic.claude-v2", "anthropic.claude-v2:1"],
        ModelFamily::MistralTiny => &["open-mistral-7b", "mistral-tiny-2312"],
        ModelFamily::MistralSmall => &["open-mixtral-8x7b", "mistral-small-latest"],
        ModelFamily::MistralMedium => &["mistral-medium-latest"],
        ModelFamily::MistralLarge => &["mistral-large-latest"],
    }
}
