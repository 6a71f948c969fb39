//! OpenAI 兼容推理服务后端
//!
//! 每个 model_id 对应一个端点（base_url + 服务端模型名）；通过 async_openai 发送单条 user 消息完成补全。
//! 「加载」即建立客户端并探测端点可用性（配置了 base_url 时），「卸载」释放客户端。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::config::{EndpointSection, ModelsSection};
use crate::llm::traits::{BackendFactory, ModelBackend};

const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
const PROBE_TIMEOUT_SECS: u64 = 10;

/// 加载前探测端点：GET {base_url}/models，连接失败或 5xx 视为加载失败
async fn probe_endpoint(http: &reqwest::Client, base_url: &str, api_key: Option<&str>) -> Result<(), String> {
    let url = format!("{}/models", base_url.trim_end_matches('/'));
    let mut req = http.get(&url);
    if let Some(key) = api_key {
        req = req.bearer_auth(key);
    }
    let resp = req
        .send()
        .await
        .map_err(|e| format!("endpoint {} unreachable: {}", base_url, e))?;
    if resp.status().is_server_error() {
        return Err(format!("endpoint {} returned {}", base_url, resp.status()));
    }
    Ok(())
}

/// 已连接的 OpenAI 兼容端点
pub struct OpenAiBackend {
    model_id: String,
    served_name: String,
    temperature: Option<f32>,
    client: Client<OpenAIConfig>,
}

impl OpenAiBackend {
    pub fn new(
        model_id: &str,
        base_url: Option<&str>,
        served_name: Option<&str>,
        api_key: Option<&str>,
        temperature: Option<f32>,
    ) -> Self {
        let api_key = api_key.unwrap_or("sk-placeholder");
        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };
        Self {
            model_id: model_id.to_string(),
            served_name: served_name.unwrap_or(model_id).to_string(),
            temperature,
            client: Client::with_config(config),
        }
    }
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(&self, prompt: &str, max_new_tokens: u32) -> Result<String, String> {
        let message = ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(prompt.to_string())
                .build()
                .map_err(|e| e.to_string())?,
        );
        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(&self.served_name)
            .messages(vec![message])
            .max_completion_tokens(max_new_tokens);
        if let Some(t) = self.temperature {
            args.temperature(t);
        }
        let request = args.build().map_err(|e| e.to_string())?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| e.to_string())?;

        if let Some(usage) = &response.usage {
            tracing::debug!(
                model_id = %self.model_id,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "generation usage"
            );
        }

        Ok(response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default())
    }
}

/// 按配置为每个 model_id 建立 OpenAiBackend
pub struct OpenAiBackendFactory {
    http: reqwest::Client,
    endpoints: HashMap<String, EndpointSection>,
    default_base_url: Option<String>,
    default_footprint: u64,
}

impl OpenAiBackendFactory {
    pub fn from_config(models: &ModelsSection) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            endpoints: models.endpoints.clone(),
            default_base_url: models.default_base_url.clone(),
            default_footprint: models.default_footprint_bytes,
        }
    }
}

#[async_trait]
impl BackendFactory for OpenAiBackendFactory {
    fn estimate_footprint(&self, model_id: &str) -> u64 {
        self.endpoints
            .get(model_id)
            .and_then(|e| e.footprint_bytes)
            .unwrap_or(self.default_footprint)
    }

    async fn load(&self, model_id: &str) -> Result<Arc<dyn ModelBackend>, String> {
        let endpoint = self.endpoints.get(model_id).cloned().unwrap_or_default();
        let base_url = endpoint.base_url.or_else(|| self.default_base_url.clone());
        let key_env = endpoint
            .api_key_env
            .as_deref()
            .unwrap_or(DEFAULT_API_KEY_ENV);
        let api_key = std::env::var(key_env).ok();

        let backend = OpenAiBackend::new(
            model_id,
            base_url.as_deref(),
            endpoint.served_name.as_deref(),
            api_key.as_deref(),
            endpoint.temperature,
        );
        if let Some(url) = base_url.as_deref() {
            probe_endpoint(&self.http, url, api_key.as_deref()).await?;
        }
        tracing::info!(model_id = %model_id, base_url = ?base_url, "connected to inference endpoint");
        Ok(Arc::new(backend))
    }
}
