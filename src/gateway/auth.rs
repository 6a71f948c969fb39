//! API Key 认证
//!
//! 除 /health 外所有路由都要求 `X-API-Key` 头；Key 保存在内存中，可通过 /api-keys 增删。

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use tokio::sync::RwLock;

use super::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone)]
struct KeyRecord {
    key_id: String,
    key_name: String,
}

/// 新建 Key 的返回值（key_value 只在此时出现一次）
#[derive(Debug, Clone, Serialize)]
pub struct IssuedKey {
    pub key_id: String,
    pub key_value: String,
    pub key_name: String,
}

/// 列表中的 Key 信息（只露出末尾 4 个字符）
#[derive(Debug, Clone, Serialize)]
pub struct KeyInfo {
    pub key_id: String,
    pub key_name: String,
    pub masked_key: String,
}

/// 内存中的 API Key 表：key_value -> (key_id, key_name)
#[derive(Debug, Default)]
pub struct ApiKeyStore {
    keys: RwLock<HashMap<String, KeyRecord>>,
}

impl ApiKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以给定 Key 值初始化（配置中的 Key 名为 initial_key）
    pub fn with_keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let map = keys
            .into_iter()
            .map(|k| {
                (
                    k.into(),
                    KeyRecord {
                        key_id: uuid::Uuid::new_v4().to_string(),
                        key_name: "initial_key".to_string(),
                    },
                )
            })
            .collect();
        Self {
            keys: RwLock::new(map),
        }
    }

    pub async fn verify(&self, key: &str) -> bool {
        self.keys.read().await.contains_key(key)
    }

    pub async fn issue(&self, key_name: &str) -> IssuedKey {
        let key_value = generate_key();
        let key_id = uuid::Uuid::new_v4().to_string();
        self.keys.write().await.insert(
            key_value.clone(),
            KeyRecord {
                key_id: key_id.clone(),
                key_name: key_name.to_string(),
            },
        );
        tracing::info!(key_id = %key_id, key_name = %key_name, "api key created");
        IssuedKey {
            key_id,
            key_value,
            key_name: key_name.to_string(),
        }
    }

    pub async fn list(&self) -> Vec<KeyInfo> {
        let keys = self.keys.read().await;
        let mut out: Vec<KeyInfo> = keys
            .iter()
            .map(|(value, rec)| KeyInfo {
                key_id: rec.key_id.clone(),
                key_name: rec.key_name.clone(),
                masked_key: mask(value),
            })
            .collect();
        out.sort_by(|a, b| a.key_name.cmp(&b.key_name).then(a.key_id.cmp(&b.key_id)));
        out
    }

    /// 按 key_id 删除；不存在时返回 false
    pub async fn revoke(&self, key_id: &str) -> bool {
        let mut keys = self.keys.write().await;
        let before = keys.len();
        keys.retain(|_, rec| rec.key_id != key_id);
        let removed = keys.len() < before;
        if removed {
            tracing::info!(key_id = %key_id, "api key revoked");
        }
        removed
    }

    pub async fn count(&self) -> usize {
        self.keys.read().await.len()
    }
}

/// 随机 Key：两个 v4 UUID 的 simple 形式拼接（64 个十六进制字符）
pub fn generate_key() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

fn mask(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("••••{}", tail)
}

/// 中间件：校验 X-API-Key
pub async fn require_api_key(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let key = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("");
    if key.is_empty() || !state.api_keys.verify(key).await {
        tracing::warn!(path = %req.uri().path(), "rejected request with invalid api key");
        return (StatusCode::UNAUTHORIZED, "Invalid API key".to_string()).into_response();
    }
    next.run(req).await
}
