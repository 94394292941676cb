use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;

/** \brief 出站调用的统一超时（第三方服务可能挂起）。 */
const REQUEST_TIMEOUT_SECS: u64 = 30;

/** \brief 凭证校验用的最小探测请求。 */
const PROBE_PROMPT: &str = "ping";
const PROBE_MAX_TOKENS: u32 = 5;

/**
 * \brief Provider 层错误分类。
 */
#[derive(Debug, Error)]
pub enum LlmError {
    /** \brief 必填配置项缺失，调用前快速失败。 */
    #[error("provider {0} is not configured")]
    NotConfigured(&'static str),
    /** \brief 凭证探测调用失败。 */
    #[error("credential check failed: {0}")]
    InvalidCredentials(String),
    /** \brief 传输错误或应答无法解析。 */
    #[error("generation failed: {0}")]
    GenerationFailed(String),
}

/**
 * \brief 受支持的文本生成后端。
 * \details 按标识符查表选择，不做继承式分发；各后端只在端点与 JSON 字段名上有差异。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Gpt,
    Gemini,
    Grok,
    DeepSeek,
}

/** \brief 全部后端，供目录接口遍历。 */
pub const ALL_PROVIDERS: &[ProviderKind] = &[
    ProviderKind::Gpt,
    ProviderKind::Gemini,
    ProviderKind::Grok,
    ProviderKind::DeepSeek,
];

/**
 * \brief Provider 声明的配置项元数据（纯静态，无 I/O）。
 */
#[derive(Debug, Clone, Serialize)]
pub struct ConfigField {
    pub key: &'static str,
    pub label: &'static str,
    /** \brief text/password/select */
    pub field_type: &'static str,
    pub required: bool,
    pub default: Option<&'static str>,
    pub options: &'static [&'static str],
    pub description: &'static str,
}

/**
 * \brief 某个 Provider 的已存配置值。
 */
#[derive(Debug, Clone, Default)]
pub struct ProviderConfig {
    values: HashMap<String, String>,
}

impl ProviderConfig {
    pub fn new(values: HashMap<String, String>) -> ProviderConfig {
        ProviderConfig { values }
    }

    /** \brief 读取配置项，空串视同缺失。 */
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/**
 * \brief 生成选项。温度默认 0.7，输出上限默认 1000。
 */
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub temperature: f64,
    pub max_tokens: u32,
    /** \brief 可选的系统指令，按各家约定放在请求最前。 */
    pub system: Option<String>,
}

impl Default for GenerateOptions {
    fn default() -> GenerateOptions {
        GenerateOptions {
            temperature: 0.7,
            max_tokens: 1000,
            system: None,
        }
    }
}

/**
 * \brief 归一化后的生成结果。
 */
#[derive(Debug, Clone, Serialize)]
pub struct Generation {
    /** \brief 生成文本。 */
    pub text: String,
    /** \brief 实际使用的模型标识。 */
    pub model: String,
    /** \brief 消耗的 token 数（后端不上报时为 0）。 */
    pub tokens: i64,
}

impl ProviderKind {
    /**
     * \brief 按标识符查表。
     */
    pub fn from_id(id: &str) -> Option<ProviderKind> {
        match id.to_ascii_lowercase().as_str() {
            "gpt" | "openai" => Some(ProviderKind::Gpt),
            "gemini" | "google" => Some(ProviderKind::Gemini),
            "grok" | "xai" => Some(ProviderKind::Grok),
            "deepseek" => Some(ProviderKind::DeepSeek),
            _ => None,
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            ProviderKind::Gpt => "gpt",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Grok => "grok",
            ProviderKind::DeepSeek => "deepseek",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ProviderKind::Gpt => "OpenAI GPT",
            ProviderKind::Gemini => "Google Gemini",
            ProviderKind::Grok => "xAI Grok",
            ProviderKind::DeepSeek => "DeepSeek",
        }
    }

    /** \brief 固定端点。Gemini 的端点按模型名拼接，见 call_gemini。 */
    pub fn endpoint(&self) -> &'static str {
        match self {
            ProviderKind::Gpt => "https://api.openai.com/v1/chat/completions",
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            ProviderKind::Grok => "https://api.x.ai/v1/chat/completions",
            ProviderKind::DeepSeek => "https://api.deepseek.com/chat/completions",
        }
    }

    /** \brief 单次请求的输出 token 预算上限。 */
    pub fn max_tokens(&self) -> u32 {
        match self {
            ProviderKind::Gpt => 4096,
            ProviderKind::Gemini => 8192,
            ProviderKind::Grok => 4096,
            ProviderKind::DeepSeek => 8192,
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::Gpt => "gpt-4o-mini",
            ProviderKind::Gemini => "gemini-2.0-flash",
            ProviderKind::Grok => "grok-2-latest",
            ProviderKind::DeepSeek => "deepseek-chat",
        }
    }

    /**
     * \brief 声明的配置项列表（静态元数据）。
     */
    pub fn config_fields(&self) -> &'static [ConfigField] {
        match self {
            ProviderKind::Gpt => &[
                ConfigField {
                    key: "api_key",
                    label: "API Key",
                    field_type: "password",
                    required: true,
                    default: None,
                    options: &[],
                    description: "OpenAI API key",
                },
                ConfigField {
                    key: "model",
                    label: "Model",
                    field_type: "select",
                    required: false,
                    default: Some("gpt-4o-mini"),
                    options: &["gpt-4o-mini", "gpt-4o", "gpt-4.1-mini"],
                    description: "Chat completions model",
                },
            ],
            ProviderKind::Gemini => &[
                ConfigField {
                    key: "api_key",
                    label: "API Key",
                    field_type: "password",
                    required: true,
                    default: None,
                    options: &[],
                    description: "Google AI Studio API key",
                },
                ConfigField {
                    key: "model",
                    label: "Model",
                    field_type: "select",
                    required: false,
                    default: Some("gemini-2.0-flash"),
                    options: &["gemini-2.0-flash", "gemini-1.5-pro"],
                    description: "Generative Language model",
                },
            ],
            ProviderKind::Grok => &[
                ConfigField {
                    key: "api_key",
                    label: "API Key",
                    field_type: "password",
                    required: true,
                    default: None,
                    options: &[],
                    description: "xAI API key",
                },
                ConfigField {
                    key: "model",
                    label: "Model",
                    field_type: "select",
                    required: false,
                    default: Some("grok-2-latest"),
                    options: &["grok-2-latest", "grok-beta"],
                    description: "Grok chat model",
                },
            ],
            ProviderKind::DeepSeek => &[
                ConfigField {
                    key: "api_key",
                    label: "API Key",
                    field_type: "password",
                    required: true,
                    default: None,
                    options: &[],
                    description: "DeepSeek API key",
                },
                ConfigField {
                    key: "model",
                    label: "Model",
                    field_type: "select",
                    required: false,
                    default: Some("deepseek-chat"),
                    options: &["deepseek-chat", "deepseek-reasoner"],
                    description: "DeepSeek chat model",
                },
            ],
        }
    }

    /**
     * \brief 所有必填配置项均有非空值时视为已配置。
     */
    pub fn is_configured(&self, cfg: &ProviderConfig) -> bool {
        self.config_fields()
            .iter()
            .filter(|f| f.required)
            .all(|f| cfg.get(f.key).is_some())
    }
}

/**
 * \brief 统一入口：组装请求、调用固定端点并归一化应答。
 * \details 未配置时在任何网络调用之前返回 NotConfigured；本层不做重试。
 */
pub async fn generate(
    kind: ProviderKind,
    cfg: &ProviderConfig,
    prompt: &str,
    context: Option<&Map<String, Value>>,
    opts: &GenerateOptions,
) -> Result<Generation, LlmError> {
    if !kind.is_configured(cfg) {
        return Err(LlmError::NotConfigured(kind.id()));
    }
    let prompt = merge_context(prompt, context);
    let model = cfg
        .get("model")
        .unwrap_or_else(|| kind.default_model())
        .to_string();
    let max_tokens = opts.max_tokens.min(kind.max_tokens());

    match kind {
        ProviderKind::Gemini => call_gemini(cfg, &model, &prompt, opts, max_tokens).await,
        _ => call_openai_style(kind, cfg, &model, &prompt, opts, max_tokens).await,
    }
}

/**
 * \brief 用候选配置发一次最小探测请求（固定短提示，输出上限 5 token），不落盘。
 */
pub async fn validate_credentials(kind: ProviderKind, cfg: &ProviderConfig) -> Result<(), LlmError> {
    let opts = GenerateOptions {
        temperature: 0.0,
        max_tokens: PROBE_MAX_TOKENS,
        system: None,
    };
    match generate(kind, cfg, PROBE_PROMPT, None, &opts).await {
        Ok(_) => Ok(()),
        Err(LlmError::NotConfigured(id)) => Err(LlmError::NotConfigured(id)),
        Err(e) => Err(LlmError::InvalidCredentials(e.to_string())),
    }
}

/**
 * \brief 共享的上下文拼接步骤：键排序后以 `key: value` 行附在提示词之后。
 */
pub fn merge_context(prompt: &str, context: Option<&Map<String, Value>>) -> String {
    let Some(ctx) = context else {
        return prompt.to_string();
    };
    if ctx.is_empty() {
        return prompt.to_string();
    }
    let mut keys: Vec<&String> = ctx.keys().collect();
    keys.sort();
    let mut out = String::from(prompt);
    out.push_str("\n\nContext:");
    for key in keys {
        let value = &ctx[key.as_str()];
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out.push('\n');
        out.push_str(key);
        out.push_str(": ");
        out.push_str(&rendered);
    }
    out
}

fn http_client() -> Result<reqwest::Client, LlmError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
        .build()
        .map_err(|e| LlmError::GenerationFailed(e.to_string()))
}

/**
 * \brief OpenAI 兼容协议（GPT/Grok/DeepSeek）：Bearer 认证，系统指令作为首条 message。
 */
async fn call_openai_style(
    kind: ProviderKind,
    cfg: &ProviderConfig,
    model: &str,
    prompt: &str,
    opts: &GenerateOptions,
    max_tokens: u32,
) -> Result<Generation, LlmError> {
    let api_key = cfg
        .get("api_key")
        .ok_or(LlmError::NotConfigured(kind.id()))?;

    let mut messages = Vec::new();
    if let Some(system) = &opts.system {
        messages.push(json!({"role": "system", "content": system}));
    }
    messages.push(json!({"role": "user", "content": prompt}));
    let body = json!({
        "model": model,
        "messages": messages,
        "temperature": opts.temperature,
        "max_tokens": max_tokens,
    });

    let client = http_client()?;
    let resp = client
        .post(kind.endpoint())
        .header(CONTENT_TYPE, "application/json")
        .header(AUTHORIZATION, format!("Bearer {}", api_key))
        .json(&body)
        .send()
        .await
        .map_err(|e| LlmError::GenerationFailed(format!("{}: {}", kind.display_name(), e)))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(LlmError::GenerationFailed(format!(
            "{} request failed: {} -> {}",
            kind.display_name(),
            status,
            text
        )));
    }
    let v: Value = resp
        .json()
        .await
        .map_err(|e| LlmError::GenerationFailed(e.to_string()))?;
    parse_openai_reply(kind, model, &v)
}

fn parse_openai_reply(kind: ProviderKind, model: &str, v: &Value) -> Result<Generation, LlmError> {
    let text = v
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| {
            LlmError::GenerationFailed(format!("{} returned an unexpected reply", kind.display_name()))
        })?;
    let tokens = v
        .get("usage")
        .and_then(|u| u.get("total_tokens"))
        .and_then(|t| t.as_i64())
        .unwrap_or(0);
    let model = v
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or(model)
        .to_string();
    Ok(Generation {
        text: text.to_string(),
        model,
        tokens,
    })
}

/**
 * \brief Gemini 协议：API Key 走查询串，系统指令放 systemInstruction；不上报 token 数。
 */
async fn call_gemini(
    cfg: &ProviderConfig,
    model: &str,
    prompt: &str,
    opts: &GenerateOptions,
    max_tokens: u32,
) -> Result<Generation, LlmError> {
    let kind = ProviderKind::Gemini;
    let api_key = cfg
        .get("api_key")
        .ok_or(LlmError::NotConfigured(kind.id()))?;
    let url = format!("{}/models/{}:generateContent", kind.endpoint(), model);

    let mut body = json!({
        "contents": [{"parts": [{"text": prompt}]}],
        "generationConfig": {
            "temperature": opts.temperature,
            "maxOutputTokens": max_tokens,
        },
    });
    if let Some(system) = &opts.system {
        body["systemInstruction"] = json!({"parts": [{"text": system}]});
    }

    let client = http_client()?;
    let resp = client
        .post(url)
        .query(&[("key", api_key)])
        .json(&body)
        .send()
        .await
        .map_err(|e| LlmError::GenerationFailed(format!("{}: {}", kind.display_name(), e)))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(LlmError::GenerationFailed(format!(
            "{} request failed: {} -> {}",
            kind.display_name(),
            status,
            text
        )));
    }
    let v: Value = resp
        .json()
        .await
        .map_err(|e| LlmError::GenerationFailed(e.to_string()))?;
    parse_gemini_reply(model, &v)
}

fn parse_gemini_reply(model: &str, v: &Value) -> Result<Generation, LlmError> {
    let parts = v
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array());
    let text = parts
        .map(|arr| {
            arr.iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            LlmError::GenerationFailed("Google Gemini returned an unexpected reply".to_string())
        })?;
    Ok(Generation {
        text,
        model: model.to_string(),
        tokens: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured(kind: ProviderKind) -> ProviderConfig {
        let mut values = HashMap::new();
        values.insert("api_key".to_string(), "test-key".to_string());
        values.insert("model".to_string(), kind.default_model().to_string());
        ProviderConfig::new(values)
    }

    #[test]
    fn test_provider_lookup_by_id() {
        assert_eq!(ProviderKind::from_id("gpt"), Some(ProviderKind::Gpt));
        assert_eq!(ProviderKind::from_id("GEMINI"), Some(ProviderKind::Gemini));
        assert_eq!(ProviderKind::from_id("xai"), Some(ProviderKind::Grok));
        assert_eq!(ProviderKind::from_id("deepseek"), Some(ProviderKind::DeepSeek));
        assert_eq!(ProviderKind::from_id("claude"), None);
    }

    #[test]
    fn test_is_configured_requires_all_required_fields() {
        for kind in ALL_PROVIDERS {
            assert!(!kind.is_configured(&ProviderConfig::default()));
            assert!(kind.is_configured(&configured(*kind)));
        }

        // 空串等同缺失
        let mut values = HashMap::new();
        values.insert("api_key".to_string(), "".to_string());
        let cfg = ProviderConfig::new(values);
        assert!(!ProviderKind::Gpt.is_configured(&cfg));
    }

    #[test]
    fn test_optional_model_field_does_not_block_configuration() {
        let mut values = HashMap::new();
        values.insert("api_key".to_string(), "test-key".to_string());
        let cfg = ProviderConfig::new(values);
        assert!(ProviderKind::Gemini.is_configured(&cfg));
    }

    #[test]
    fn test_merge_context_sorts_keys() {
        let mut ctx = Map::new();
        ctx.insert("zeta".to_string(), Value::String("last".to_string()));
        ctx.insert("alpha".to_string(), json!(42));
        let merged = merge_context("summarize", Some(&ctx));
        assert_eq!(merged, "summarize\n\nContext:\nalpha: 42\nzeta: last");
    }

    #[test]
    fn test_merge_context_without_context_is_identity() {
        assert_eq!(merge_context("hello", None), "hello");
        let empty = Map::new();
        assert_eq!(merge_context("hello", Some(&empty)), "hello");
    }

    #[test]
    fn test_parse_openai_reply() {
        let v = json!({
            "model": "gpt-4o-mini-2024",
            "choices": [{"message": {"role": "assistant", "content": "hi there"}}],
            "usage": {"total_tokens": 17}
        });
        let g = parse_openai_reply(ProviderKind::Gpt, "gpt-4o-mini", &v).expect("parse");
        assert_eq!(g.text, "hi there");
        assert_eq!(g.model, "gpt-4o-mini-2024");
        assert_eq!(g.tokens, 17);
    }

    #[test]
    fn test_parse_openai_reply_without_usage_reports_zero_tokens() {
        let v = json!({
            "choices": [{"message": {"content": "ok"}}]
        });
        let g = parse_openai_reply(ProviderKind::DeepSeek, "deepseek-chat", &v).expect("parse");
        assert_eq!(g.tokens, 0);
        assert_eq!(g.model, "deepseek-chat");
    }

    #[test]
    fn test_parse_openai_reply_rejects_malformed_payload() {
        let v = json!({"error": {"message": "bad key"}});
        let err = parse_openai_reply(ProviderKind::Grok, "grok-2-latest", &v).unwrap_err();
        assert!(matches!(err, LlmError::GenerationFailed(_)));
    }

    #[test]
    fn test_parse_gemini_reply_joins_parts() {
        let v = json!({
            "candidates": [{"content": {"parts": [{"text": "book "}, {"text": "order"}]}}]
        });
        let g = parse_gemini_reply("gemini-2.0-flash", &v).expect("parse");
        assert_eq!(g.text, "book order");
        assert_eq!(g.tokens, 0);
    }

    #[test]
    fn test_parse_gemini_reply_rejects_empty_candidates() {
        let v = json!({"candidates": []});
        assert!(parse_gemini_reply("gemini-2.0-flash", &v).is_err());
    }

    #[tokio::test]
    async fn test_generate_fails_fast_when_not_configured() {
        for kind in ALL_PROVIDERS {
            let err = generate(
                *kind,
                &ProviderConfig::default(),
                "hello",
                None,
                &GenerateOptions::default(),
            )
            .await
            .unwrap_err();
            assert!(matches!(err, LlmError::NotConfigured(_)), "{:?}", kind);
        }
    }

    #[tokio::test]
    async fn test_validate_credentials_propagates_not_configured() {
        let err = validate_credentials(ProviderKind::Gpt, &ProviderConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::NotConfigured("gpt")));
    }
}
