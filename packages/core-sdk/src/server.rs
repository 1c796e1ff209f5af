use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::generation::GenerationService;
use crate::models::{Message, ProviderKind, Settings};
use crate::telemetry;

/**
 * \brief 启动本地 HTTP 服务，把生成核心暴露给前端。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 */
pub async fn run(addr: &str, service: Arc<GenerationService>) -> Result<()> {
    let app = router(service);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief 组装路由；服务实例经 State 注入，各 handler 共享同一份。
 */
pub fn router(service: Arc<GenerationService>) -> Router {
    Router::new()
        .route("/api/settings", get(get_settings))
        .route("/api/settings/key", post(set_key))
        .route("/api/settings/default-model", post(set_default_model))
        .route("/api/settings/local-url", post(set_local_url))
        .route("/api/models", get(list_models))
        .route("/api/generate", post(generate))
        .route("/api/generate/abort", post(abort_generation))
        .with_state(service)
}

#[derive(Serialize, Debug)]
struct SettingsView {
    /** \brief 凭据只回报"是否已配置"，不回传明文 */
    has_openai_key: bool,
    has_openrouter_key: bool,
    has_gemini_key: bool,
    local_api_url: String,
    last_models_fetch: Option<String>,
    default_local_model: Option<String>,
    default_openai_model: Option<String>,
    default_openrouter_model: Option<String>,
    default_gemini_model: Option<String>,
}

impl From<Settings> for SettingsView {
    fn from(settings: Settings) -> SettingsView {
        SettingsView {
            has_openai_key: settings.openai_api_key.is_some(),
            has_openrouter_key: settings.openrouter_api_key.is_some(),
            has_gemini_key: settings.gemini_api_key.is_some(),
            local_api_url: settings.local_api_url,
            last_models_fetch: settings.last_models_fetch,
            default_local_model: settings.default_local_model,
            default_openai_model: settings.default_openai_model,
            default_openrouter_model: settings.default_openrouter_model,
            default_gemini_model: settings.default_gemini_model,
        }
    }
}

#[derive(Deserialize, Debug)]
struct KeyRequest {
    /** \brief Provider 类型 */
    provider: String,
    /** \brief API 密钥 */
    key: String,
}

#[derive(Deserialize, Debug)]
struct DefaultModelRequest {
    provider: String,
    model: String,
}

#[derive(Deserialize, Debug)]
struct LocalUrlRequest {
    url: String,
}

#[derive(Deserialize, Debug)]
struct ModelQuery {
    /** \brief 只看某个 Provider（可选） */
    provider: Option<String>,
    /** \brief 是否强制重新发现（默认 false） */
    refresh: Option<bool>,
}

#[derive(Deserialize, Debug)]
struct GenerateRequest {
    /** \brief Provider 类型 */
    provider: String,
    /** \brief 已组装完成的消息序列，本服务不做任何模板化 */
    messages: Vec<Message>,
    /** \brief 模型 ID */
    model: String,
    /** \brief 采样温度（默认 0.7） */
    temperature: Option<f32>,
    /** \brief 生成上限（默认 1024） */
    max_tokens: Option<u32>,
}

async fn get_settings(
    State(service): State<Arc<GenerationService>>,
) -> Result<Json<SettingsView>, (StatusCode, String)> {
    let settings = service.settings().map_err(internal_err)?;
    Ok(Json(settings.into()))
}

/**
 * \brief 保存凭据并同步刷新该 Provider 的模型目录；刷新失败原样上抛。
 */
async fn set_key(
    State(service): State<Arc<GenerationService>>,
    Json(payload): Json<KeyRequest>,
) -> Result<Json<SettingsView>, (StatusCode, String)> {
    let kind = parse_provider(&payload.provider)?;
    service.update_key(kind, &payload.key).await.map_err(internal_err)?;
    telemetry::log_event("server.settings", &format!("update key provider={}", kind));
    let settings = service.settings().map_err(internal_err)?;
    Ok(Json(settings.into()))
}

async fn set_default_model(
    State(service): State<Arc<GenerationService>>,
    Json(payload): Json<DefaultModelRequest>,
) -> Result<Json<SettingsView>, (StatusCode, String)> {
    let kind = parse_provider(&payload.provider)?;
    service
        .update_default_model(kind, &payload.model)
        .map_err(internal_err)?;
    let settings = service.settings().map_err(internal_err)?;
    Ok(Json(settings.into()))
}

async fn set_local_url(
    State(service): State<Arc<GenerationService>>,
    Json(payload): Json<LocalUrlRequest>,
) -> Result<Json<SettingsView>, (StatusCode, String)> {
    service
        .update_local_api_url(&payload.url)
        .await
        .map_err(internal_err)?;
    telemetry::log_event("server.settings", &format!("local url -> {}", payload.url));
    let settings = service.settings().map_err(internal_err)?;
    Ok(Json(settings.into()))
}

async fn list_models(
    State(service): State<Arc<GenerationService>>,
    Query(q): Query<ModelQuery>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let kind = match &q.provider {
        Some(value) => Some(parse_provider(value)?),
        None => None,
    };
    let models = service
        .get_available_models(kind, q.refresh.unwrap_or(false))
        .await
        .map_err(internal_err)?;
    Ok(Json(serde_json::json!({ "models": models })))
}

/**
 * \brief 生成接口：本地 Provider 返回原始片段字节，其余返回 SSE；
 *        用户取消表现为 204 空响应，前端据此与"真空成功"区分。
 */
async fn generate(
    State(service): State<Arc<GenerationService>>,
    Json(payload): Json<GenerateRequest>,
) -> Result<Response, (StatusCode, String)> {
    let kind = parse_provider(&payload.provider)?;
    service
        .generate(
            kind,
            &payload.messages,
            &payload.model,
            payload.temperature.unwrap_or(0.7),
            payload.max_tokens.unwrap_or(1024),
        )
        .await
        .map_err(internal_err)
}

async fn abort_generation(
    State(service): State<Arc<GenerationService>>,
) -> Json<serde_json::Value> {
    service.abort_stream();
    Json(serde_json::json!({ "ok": true }))
}

fn parse_provider(value: &str) -> Result<ProviderKind, (StatusCode, String)> {
    ProviderKind::parse(value)
        .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("unknown provider type: {}", value)))
}

fn internal_err<E: std::fmt::Display>(e: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
