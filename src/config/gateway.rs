use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::error::{GatewayError, Result};

/// Inbound wire dialect served by one listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiType {
    #[serde(alias = "claude")]
    Anthropic,
    #[serde(alias = "codex", alias = "responses")]
    OpenaiResponses,
    #[serde(alias = "chat")]
    OpenaiChat,
}

impl ApiType {
    pub const ALL: [ApiType; 3] = [
        ApiType::Anthropic,
        ApiType::OpenaiResponses,
        ApiType::OpenaiChat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApiType::Anthropic => "anthropic",
            ApiType::OpenaiResponses => "openai_responses",
            ApiType::OpenaiChat => "openai_chat",
        }
    }
}

impl fmt::Display for ApiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiType {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(ApiType::Anthropic),
            "openai_responses" | "codex" | "responses" => Ok(ApiType::OpenaiResponses),
            "openai_chat" | "chat" => Ok(ApiType::OpenaiChat),
            other => Err(GatewayError::Validation(format!("unknown api type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    /// USD per million input tokens
    pub input_per_mtok: f64,
    /// USD per million output tokens
    pub output_per_mtok: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        // 0.000002 / token
        Self {
            input_per_mtok: 2.0,
            output_per_mtok: 2.0,
        }
    }
}

impl Pricing {
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        input_tokens as f64 * self.input_per_mtok / 1_000_000.0
            + output_tokens as f64 * self.output_per_mtok / 1_000_000.0
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    /// inbound model name -> provider model name
    #[serde(default)]
    pub model_mapping: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_types")]
    pub api_types: BTreeSet<ApiType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pricing: Option<Pricing>,
}

// api_key 不允许出现在日志里
impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &mask_key(&self.api_key))
            .field("model_mapping", &self.model_mapping)
            .field("enabled", &self.enabled)
            .field("api_types", &self.api_types)
            .field("timeout_secs", &self.timeout_secs)
            .field("pricing", &self.pricing)
            .finish()
    }
}

fn default_true() -> bool {
    true
}

fn default_api_types() -> BTreeSet<ApiType> {
    ApiType::ALL.into_iter().collect()
}

/// Key under which a catch-all mapping can be declared.
pub const WILDCARD_MODEL: &str = "*";

pub fn normalize_model_name(model: &str) -> String {
    model.trim().to_ascii_lowercase()
}

impl Provider {
    pub fn supports(&self, api_type: ApiType) -> bool {
        self.api_types.contains(&api_type)
    }

    /// Resolve the upstream model name: exact key, normalised key, then `*`.
    pub fn map_model(&self, model: &str) -> String {
        if let Some(mapped) = self.model_mapping.get(model) {
            return mapped.clone();
        }
        let wanted = normalize_model_name(model);
        if let Some((_, mapped)) = self
            .model_mapping
            .iter()
            .find(|(k, _)| normalize_model_name(k) == wanted)
        {
            return mapped.clone();
        }
        if let Some(mapped) = self.model_mapping.get(WILDCARD_MODEL) {
            return mapped.clone();
        }
        model.to_string()
    }

    pub fn pricing(&self) -> Pricing {
        self.pricing.unwrap_or_default()
    }

    pub fn redacted(&self) -> Provider {
        let mut p = self.clone();
        if !p.api_key.is_empty() {
            p.api_key = mask_key(&p.api_key);
        }
        p
    }

    pub fn validate(&self) -> Result<()> {
        let label = if self.name.is_empty() { &self.id } else { &self.name };
        if self.name.trim().is_empty() {
            return Err(GatewayError::Validation(format!(
                "provider '{}' must have a name",
                self.id
            )));
        }
        let url = reqwest::Url::parse(&self.base_url).map_err(|e| {
            GatewayError::Validation(format!("provider '{}' has invalid base_url: {}", label, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(GatewayError::Validation(format!(
                "provider '{}' base_url must be an absolute http(s) URL",
                label
            )));
        }
        if self.api_types.is_empty() {
            return Err(GatewayError::Validation(format!(
                "provider '{}' must support at least one api type",
                label
            )));
        }
        if self.timeout_secs == Some(0) {
            return Err(GatewayError::Validation(format!(
                "provider '{}' timeout_secs must be positive",
                label
            )));
        }
        let mut seen = HashSet::new();
        for (from, to) in &self.model_mapping {
            if from.trim().is_empty() || to.trim().is_empty() {
                return Err(GatewayError::Validation(format!(
                    "provider '{}' has an empty model mapping entry",
                    label
                )));
            }
            if !seen.insert(normalize_model_name(from)) {
                return Err(GatewayError::Validation(format!(
                    "provider '{}' maps model '{}' more than once",
                    label, from
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolsConfig {
    #[serde(default = "default_anthropic")]
    pub anthropic: ProtocolConfig,
    #[serde(default = "default_openai_responses")]
    pub openai_responses: ProtocolConfig,
    #[serde(default = "default_openai_chat")]
    pub openai_chat: ProtocolConfig,
}

fn default_anthropic() -> ProtocolConfig {
    ProtocolConfig {
        enabled: true,
        port: 12345,
    }
}

fn default_openai_responses() -> ProtocolConfig {
    ProtocolConfig {
        enabled: true,
        port: 12346,
    }
}

fn default_openai_chat() -> ProtocolConfig {
    ProtocolConfig {
        enabled: true,
        port: 12347,
    }
}

impl Default for ProtocolsConfig {
    fn default() -> Self {
        Self {
            anthropic: default_anthropic(),
            openai_responses: default_openai_responses(),
            openai_chat: default_openai_chat(),
        }
    }
}

impl ProtocolsConfig {
    pub fn get(&self, api_type: ApiType) -> ProtocolConfig {
        match api_type {
            ApiType::Anthropic => self.anthropic,
            ApiType::OpenaiResponses => self.openai_responses,
            ApiType::OpenaiChat => self.openai_chat,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub protocols: ProtocolsConfig,
    /// Ordered: the default trial order for routing.
    #[serde(default)]
    pub providers: Vec<Provider>,
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            protocols: ProtocolsConfig::default(),
            providers: vec![],
            fallback_enabled: true,
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<()> {
        let mut ports: BTreeMap<u16, ApiType> = BTreeMap::new();
        for api_type in ApiType::ALL {
            let proto = self.protocols.get(api_type);
            if !proto.enabled {
                continue;
            }
            if proto.port == 0 {
                return Err(GatewayError::Validation(format!(
                    "protocol {} is enabled without a port",
                    api_type
                )));
            }
            if let Some(other) = ports.insert(proto.port, api_type) {
                return Err(GatewayError::Validation(format!(
                    "protocols {} and {} both listen on port {}",
                    other, api_type, proto.port
                )));
            }
        }

        let mut ids = HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                return Err(GatewayError::Validation(format!(
                    "provider '{}' has an empty id",
                    provider.name
                )));
            }
            if !ids.insert(provider.id.as_str()) {
                return Err(GatewayError::Validation(format!(
                    "duplicate provider id '{}'",
                    provider.id
                )));
            }
            provider.validate()?;
        }
        Ok(())
    }

    pub fn provider(&self, id: &str) -> Option<&Provider> {
        self.providers.iter().find(|p| p.id == id)
    }

    pub fn redacted(&self) -> GatewayConfig {
        GatewayConfig {
            protocols: self.protocols.clone(),
            providers: self.providers.iter().map(Provider::redacted).collect(),
            fallback_enabled: self.fallback_enabled,
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        let config: GatewayConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        // 先写临时文件再 rename，避免写一半的配置
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

// 密钥脱敏：保留首尾各 4 位
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let start: String = chars[..4].iter().collect();
    let end: String = chars[chars.len() - 4..].iter().collect();
    format!("{}****{}", start, end)
}
