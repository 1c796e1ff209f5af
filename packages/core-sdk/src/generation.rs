use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_stream::stream;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio_util::sync::CancellationToken;

use crate::db::SettingsStore;
use crate::error::{GenerationError, Result};
use crate::models::{Message, Model, ProviderKind, Settings, SettingsPatch};
use crate::providers::ProviderRegistry;
use crate::stream::{raw_body, sse_body, FragmentStream};
use crate::telemetry;

/**
 * \brief 会话句柄：服务同一时刻至多追踪一个，可被 abort_stream 取消。
 */
struct ActiveSession {
    id: u64,
    token: CancellationToken,
}

/**
 * \brief 生成核心的对外门面：设置持久化、模型目录缓存与合并、单航道取消、
 *        以及决定是否对 Provider 流做 SSE 封帧的 generate 入口。
 * \details 显式实例，由调用方构造并注入，不做进程级全局。
 */
pub struct GenerationService {
    store: Arc<dyn SettingsStore>,
    registry: ProviderRegistry,
    /** \brief 内存中的设置缓存；并发写为 last-write-wins，设置读多写少，可接受。 */
    settings: Mutex<Option<Settings>>,
    active: Arc<Mutex<Option<ActiveSession>>>,
    session_seq: AtomicU64,
}

impl GenerationService {
    pub fn new(store: Arc<dyn SettingsStore>, registry: ProviderRegistry) -> GenerationService {
        GenerationService {
            store,
            registry,
            settings: Mutex::new(None),
            active: Arc::new(Mutex::new(None)),
            session_seq: AtomicU64::new(1),
        }
    }

    /**
     * \brief 启动时调用一次：拉取持久化设置，并把已有凭据的 Provider 全部预初始化。
     */
    pub async fn initialize(&self) -> Result<()> {
        let settings = self.store.load()?;
        self.registry
            .initialize(ProviderKind::Local, Some(&settings.local_api_url));
        for kind in [
            ProviderKind::OpenAi,
            ProviderKind::OpenRouter,
            ProviderKind::Gemini,
        ] {
            if let Some(key) = settings.credential_for(kind) {
                self.registry.initialize(kind, Some(key));
            }
        }
        self.cache_settings(settings);
        Ok(())
    }

    /**
     * \brief 保存指定 Provider 的凭据，重建其客户端，并同步刷新一次模型目录。
     * \details 这里的刷新是用户主动触发的，失败必须上抛给调用方；
     *          这与后台发现的空列表降级是刻意的不对称。
     */
    pub async fn update_key(&self, kind: ProviderKind, key: &str) -> Result<()> {
        let settings = self.store.load()?;
        self.store
            .update(settings.id, &SettingsPatch::with_credential(kind, key))?;
        let fresh = self.sync_settings()?;
        self.registry
            .initialize(kind, self.credential_of(&fresh, kind).as_deref());

        let models = self.registry.get(kind).try_fetch_models().await?;
        self.replace_models(kind, models)?;
        Ok(())
    }

    /**
     * \brief 返回模型目录视图，可选只看某个 Provider、可选强制重新发现。
     * \details 先与存储重新同步（多开窗口下防止读到陈旧缓存）；强制发现的结果
     *          对该 Provider 做整体替换合并：旧条目全部丢弃，其他 Provider 不动。
     */
    pub async fn get_available_models(
        &self,
        provider: Option<ProviderKind>,
        force_refresh: bool,
    ) -> Result<Vec<Model>> {
        let settings = self.sync_settings()?;
        let mut view = settings.available_models.clone();

        if force_refresh {
            if let Some(kind) = provider {
                let instance = self.registry.get(kind);
                if !instance.is_initialized() {
                    if let Some(credential) = self.credential_of(&settings, kind) {
                        instance.initialize(Some(&credential));
                    }
                }
                // 后台式发现：失败已在 Provider 内降级为空列表
                let fresh = instance.fetch_models().await;
                view = self.replace_models(kind, fresh)?;
            }
        }

        Ok(match provider {
            Some(kind) => view.into_iter().filter(|m| m.provider == kind).collect(),
            None => view,
        })
    }

    /**
     * \brief 发起一次生成，返回 HTTP 风格的响应。
     * \details 本地 Provider 返回未封帧的原始片段字节；其余 Provider 先按需用
     *          已存凭据懒初始化（无凭据立即报配置错误，不做静默回退），成功后
     *          对流做 SSE 封帧。取消不算失败：以 204 空响应哨兵返回。
     */
    pub async fn generate(
        &self,
        kind: ProviderKind,
        messages: &[Message],
        model_id: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<Response> {
        let session_id = self.session_seq.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        {
            // 直接替换而非串联：上一个会话的句柄从此脱管，其底层请求仍在运行，
            // 但任何后续 abort_stream 都再也够不到它（单航道约束，见 DESIGN.md）
            let mut guard = self.active.lock().expect("lock active session");
            *guard = Some(ActiveSession {
                id: session_id,
                token: token.clone(),
            });
        }

        let settings = match self.sync_settings() {
            Ok(settings) => settings,
            Err(err) => {
                self.clear_session(session_id);
                return Err(err);
            }
        };

        let provider = self.registry.get(kind);
        if !provider.is_initialized() {
            match self.credential_of(&settings, kind) {
                Some(credential) => provider.initialize(Some(&credential)),
                None => {
                    self.clear_session(session_id);
                    return Err(GenerationError::Configuration(kind));
                }
            }
        }

        telemetry::log_event(
            "generation",
            &format!("provider={} model={} msgs={}", kind, model_id, messages.len()),
        );

        match provider
            .generate(messages, model_id, temperature, max_tokens, token.clone())
            .await
        {
            Ok(fragments) => {
                let fragments = self.with_session_guard(session_id, fragments);
                let response = if kind == ProviderKind::Local {
                    (
                        StatusCode::OK,
                        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                        raw_body(fragments),
                    )
                        .into_response()
                } else {
                    (
                        StatusCode::OK,
                        [(header::CONTENT_TYPE, "text/event-stream")],
                        sse_body(fragments),
                    )
                        .into_response()
                };
                Ok(response)
            }
            Err(err) if err.is_cancelled() => {
                self.clear_session(session_id);
                Ok(StatusCode::NO_CONTENT.into_response())
            }
            Err(err) => {
                self.clear_session(session_id);
                telemetry::log_error("generation", &format!("{} generate failed: {}", kind, err));
                Err(err)
            }
        }
    }

    /**
     * \brief 取消当前追踪的生成并清空句柄；空闲时调用是安全的 no-op。
     */
    pub fn abort_stream(&self) {
        let mut guard = self.active.lock().expect("lock active session");
        if let Some(session) = guard.take() {
            session.token.cancel();
        }
    }

    /**
     * \brief 持久化指定 Provider 的默认模型。
     */
    pub fn update_default_model(&self, kind: ProviderKind, model_id: &str) -> Result<()> {
        let settings = self.store.load()?;
        self.store
            .update(settings.id, &SettingsPatch::with_default_model(kind, model_id))?;
        self.sync_settings()?;
        Ok(())
    }

    /**
     * \brief 持久化本地服务地址，重指本地客户端并重新触发一次发现（失败降级）。
     */
    pub async fn update_local_api_url(&self, url: &str) -> Result<()> {
        let settings = self.store.load()?;
        self.store.update(
            settings.id,
            &SettingsPatch {
                local_api_url: Some(url.to_string()),
                ..Default::default()
            },
        )?;
        self.sync_settings()?;
        self.registry.initialize(ProviderKind::Local, Some(url));
        let fresh = self.registry.get(ProviderKind::Local).fetch_models().await;
        self.replace_models(ProviderKind::Local, fresh)?;
        Ok(())
    }

    /**
     * \brief 返回与存储重新同步后的设置副本。
     */
    pub fn settings(&self) -> Result<Settings> {
        self.sync_settings()
    }

    /** \brief 从存储重读设置并更新内存缓存。 */
    fn sync_settings(&self) -> Result<Settings> {
        let settings = self.store.load()?;
        self.cache_settings(settings.clone());
        Ok(settings)
    }

    fn cache_settings(&self, settings: Settings) {
        let mut guard = self.settings.lock().expect("lock settings cache");
        *guard = Some(settings);
    }

    fn credential_of(&self, settings: &Settings, kind: ProviderKind) -> Option<String> {
        match kind {
            ProviderKind::Local => Some(settings.local_api_url.clone()),
            _ => settings.credential_for(kind).map(|s| s.to_string()),
        }
    }

    /**
     * \brief 整体替换合并：丢弃该 Provider 的全部旧缓存条目，换成这次的结果。
     */
    fn replace_models(&self, kind: ProviderKind, fresh: Vec<Model>) -> Result<Vec<Model>> {
        let settings = self.store.load()?;
        let mut merged: Vec<Model> = settings
            .available_models
            .into_iter()
            .filter(|m| m.provider != kind)
            .collect();
        merged.extend(fresh);
        self.store.update(
            settings.id,
            &SettingsPatch {
                available_models: Some(merged.clone()),
                last_models_fetch: Some(now_rfc3339()),
                ..Default::default()
            },
        )?;
        if let Ok(mut guard) = self.settings.lock() {
            if let Some(cached) = guard.as_mut() {
                cached.available_models = merged.clone();
            }
        }
        Ok(merged)
    }

    /**
     * \brief 给片段流挂上会话守卫：流被消费完或被丢弃时，若追踪的仍是本会话
     *        则自动清除句柄。
     */
    fn with_session_guard(&self, session_id: u64, fragments: FragmentStream) -> FragmentStream {
        let guard = SessionGuard {
            id: session_id,
            active: Arc::clone(&self.active),
        };
        Box::pin(stream! {
            let _guard = guard;
            let mut fragments = fragments;
            while let Some(item) = fragments.next().await {
                yield item;
            }
        })
    }

    fn clear_session(&self, session_id: u64) {
        let mut guard = self.active.lock().expect("lock active session");
        if guard.as_ref().map(|s| s.id == session_id).unwrap_or(false) {
            *guard = None;
        }
    }
}

struct SessionGuard {
    id: u64,
    active: Arc<Mutex<Option<ActiveSession>>>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.active.lock() {
            if guard.as_ref().map(|s| s.id == self.id).unwrap_or(false) {
                *guard = None;
            }
        }
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DEFAULT_LOCAL_API_URL;
    use crate::providers::AiProvider;
    use crate::stream::consume_sse;
    use async_trait::async_trait;
    use futures_util::stream as fstream;
    use std::cell::RefCell;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    struct MemoryStore {
        settings: StdMutex<Settings>,
    }

    impl MemoryStore {
        fn new() -> Arc<MemoryStore> {
            Arc::new(MemoryStore {
                settings: StdMutex::new(Settings {
                    id: 1,
                    openai_api_key: None,
                    openrouter_api_key: None,
                    gemini_api_key: None,
                    local_api_url: DEFAULT_LOCAL_API_URL.to_string(),
                    available_models: Vec::new(),
                    last_models_fetch: None,
                    default_local_model: None,
                    default_openai_model: None,
                    default_openrouter_model: None,
                    default_gemini_model: None,
                }),
            })
        }

        fn snapshot(&self) -> Settings {
            self.settings.lock().expect("lock store").clone()
        }
    }

    impl SettingsStore for MemoryStore {
        fn load(&self) -> Result<Settings> {
            Ok(self.snapshot())
        }

        fn update(&self, _id: i64, patch: &SettingsPatch) -> Result<()> {
            let mut settings = self.settings.lock().expect("lock store");
            if let Some(v) = &patch.openai_api_key {
                settings.openai_api_key = Some(v.clone());
            }
            if let Some(v) = &patch.openrouter_api_key {
                settings.openrouter_api_key = Some(v.clone());
            }
            if let Some(v) = &patch.gemini_api_key {
                settings.gemini_api_key = Some(v.clone());
            }
            if let Some(v) = &patch.local_api_url {
                settings.local_api_url = v.clone();
            }
            if let Some(v) = &patch.available_models {
                settings.available_models = v.clone();
            }
            if let Some(v) = &patch.last_models_fetch {
                settings.last_models_fetch = Some(v.clone());
            }
            if let Some(v) = &patch.default_openai_model {
                settings.default_openai_model = Some(v.clone());
            }
            Ok(())
        }
    }

    /**
     * \brief 测试替身：按脚本产出片段，或挂起直到被取消。
     */
    struct FakeProvider {
        kind: ProviderKind,
        initialized: StdMutex<bool>,
        fragments: Vec<String>,
        models: Result<Vec<Model>>,
        hang_until_cancelled: bool,
        entered: Arc<Notify>,
        seen_tokens: StdMutex<Vec<CancellationToken>>,
    }

    impl FakeProvider {
        fn streaming(kind: ProviderKind, fragments: &[&str]) -> FakeProvider {
            FakeProvider {
                kind,
                initialized: StdMutex::new(true),
                fragments: fragments.iter().map(|s| s.to_string()).collect(),
                models: Ok(Vec::new()),
                hang_until_cancelled: false,
                entered: Arc::new(Notify::new()),
                seen_tokens: StdMutex::new(Vec::new()),
            }
        }

        fn hanging(kind: ProviderKind) -> FakeProvider {
            let mut fake = FakeProvider::streaming(kind, &[]);
            fake.hang_until_cancelled = true;
            fake
        }

        fn uninitialized(kind: ProviderKind) -> FakeProvider {
            let fake = FakeProvider::streaming(kind, &[]);
            *fake.initialized.lock().expect("lock") = false;
            fake
        }

        fn with_models(kind: ProviderKind, models: Result<Vec<Model>>) -> FakeProvider {
            let mut fake = FakeProvider::streaming(kind, &[]);
            fake.models = models;
            fake
        }
    }

    #[async_trait]
    impl AiProvider for FakeProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        fn initialize(&self, credential: Option<&str>) {
            if credential.is_some() {
                *self.initialized.lock().expect("lock") = true;
            }
        }

        fn is_initialized(&self) -> bool {
            *self.initialized.lock().expect("lock")
        }

        async fn try_fetch_models(&self) -> Result<Vec<Model>> {
            match &self.models {
                Ok(models) => Ok(models.clone()),
                Err(_) => Err(GenerationError::discovery(self.kind, "scripted failure")),
            }
        }

        async fn generate(
            &self,
            _messages: &[Message],
            _model_id: &str,
            _temperature: f32,
            _max_tokens: u32,
            cancel: CancellationToken,
        ) -> Result<FragmentStream> {
            self.seen_tokens.lock().expect("lock").push(cancel.clone());
            self.entered.notify_one();
            if self.hang_until_cancelled {
                cancel.cancelled().await;
                return Err(GenerationError::Cancelled);
            }
            let items: Vec<Result<String>> =
                self.fragments.iter().cloned().map(Ok).collect();
            Ok(Box::pin(fstream::iter(items)))
        }
    }

    fn model(provider: ProviderKind, id: &str) -> Model {
        Model {
            id: id.to_string(),
            name: id.to_string(),
            provider,
            context_length: 4096,
            enabled: true,
        }
    }

    fn user(content: &str) -> Vec<Message> {
        vec![Message {
            role: "user".to_string(),
            content: content.to_string(),
        }]
    }

    fn service_with(providers: Vec<Arc<dyn AiProvider>>) -> (GenerationService, Arc<MemoryStore>) {
        let store = MemoryStore::new();
        let service = GenerationService::new(
            store.clone(),
            ProviderRegistry::from_providers(providers),
        );
        (service, store)
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        String::from_utf8(bytes.to_vec()).expect("utf8 body")
    }

    #[tokio::test]
    async fn test_local_generate_returns_raw_unframed_stream() {
        let fake = Arc::new(FakeProvider::streaming(ProviderKind::Local, &["Hello", " world"]));
        let (service, _) = service_with(vec![fake]);
        let response = service
            .generate(ProviderKind::Local, &user("hi"), "llama3:8b", 0.7, 256)
            .await
            .expect("generate");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "Hello world");
    }

    #[tokio::test]
    async fn test_remote_generate_is_sse_wrapped() {
        let fake = Arc::new(FakeProvider::streaming(ProviderKind::OpenAi, &["Hello", " world"]));
        let (service, store) = service_with(vec![fake]);
        store
            .update(1, &SettingsPatch::with_credential(ProviderKind::OpenAi, "sk-test"))
            .expect("store key");
        let response = service
            .generate(ProviderKind::OpenAi, &user("hi"), "gpt-4", 0.7, 256)
            .await
            .expect("generate");
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).map(|v| v.as_bytes()),
            Some(b"text/event-stream".as_ref())
        );

        let chunks = response
            .into_body()
            .into_data_stream()
            .map(|item| item.map_err(GenerationError::transport));
        let tokens = RefCell::new(Vec::new());
        let completions = RefCell::new(0u32);
        consume_sse(
            Box::pin(chunks),
            |t| tokens.borrow_mut().push(t.to_string()),
            || *completions.borrow_mut() += 1,
            |err| panic!("unexpected stream error: {}", err),
        )
        .await;
        assert_eq!(tokens.borrow().join(""), "Hello world");
        assert_eq!(*completions.borrow(), 1);
    }

    #[tokio::test]
    async fn test_generate_without_credential_fails_fast() {
        let fake = Arc::new(FakeProvider::uninitialized(ProviderKind::Gemini));
        let (service, _) = service_with(vec![fake]);
        let result = service
            .generate(ProviderKind::Gemini, &user("hi"), "gemini-1.5-flash", 0.7, 256)
            .await;
        assert!(matches!(result, Err(GenerationError::Configuration(ProviderKind::Gemini))));
    }

    #[tokio::test]
    async fn test_generate_lazily_initializes_from_stored_credential() {
        let fake = Arc::new(FakeProvider::uninitialized(ProviderKind::OpenAi));
        let (service, store) = service_with(vec![fake.clone()]);
        store
            .update(1, &SettingsPatch::with_credential(ProviderKind::OpenAi, "sk-test"))
            .expect("store key");
        service
            .generate(ProviderKind::OpenAi, &user("hi"), "gpt-4", 0.7, 256)
            .await
            .expect("generate");
        assert!(fake.is_initialized());
    }

    #[tokio::test]
    async fn test_cancel_before_first_byte_yields_204_sentinel() {
        let fake = Arc::new(FakeProvider::hanging(ProviderKind::OpenAi));
        let (service, store) = service_with(vec![fake.clone()]);
        store
            .update(1, &SettingsPatch::with_credential(ProviderKind::OpenAi, "sk-test"))
            .expect("store key");
        let service = Arc::new(service);

        let svc = service.clone();
        let handle =
            tokio::spawn(async move { svc.generate(ProviderKind::OpenAi, &user("hi"), "gpt-4", 0.7, 256).await });
        fake.entered.notified().await;
        service.abort_stream();

        let response = handle.await.expect("join").expect("no error for cancellation");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(body_text(response).await, "");
    }

    #[tokio::test]
    async fn test_abort_with_nothing_in_flight_is_noop() {
        let (service, _) = service_with(vec![Arc::new(FakeProvider::streaming(
            ProviderKind::Local,
            &[],
        ))]);
        service.abort_stream();
        service.abort_stream();
        assert!(service.active.lock().expect("lock").is_none());
    }

    #[tokio::test]
    async fn test_second_generate_detaches_first_session() {
        let fake = Arc::new(FakeProvider::hanging(ProviderKind::OpenAi));
        let (service, store) = service_with(vec![fake.clone()]);
        store
            .update(1, &SettingsPatch::with_credential(ProviderKind::OpenAi, "sk-test"))
            .expect("store key");
        let service = Arc::new(service);

        let svc1 = service.clone();
        let first =
            tokio::spawn(async move { svc1.generate(ProviderKind::OpenAi, &user("a"), "gpt-4", 0.7, 256).await });
        fake.entered.notified().await;
        let svc2 = service.clone();
        let second =
            tokio::spawn(async move { svc2.generate(ProviderKind::OpenAi, &user("b"), "gpt-4", 0.7, 256).await });
        fake.entered.notified().await;

        // 取消只命中第二个会话；第一个的令牌已脱管，相应请求无法再被取消
        service.abort_stream();
        let response = second.await.expect("join").expect("second call");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let tokens = fake.seen_tokens.lock().expect("lock");
        assert_eq!(tokens.len(), 2);
        assert!(!tokens[0].is_cancelled());
        assert!(tokens[1].is_cancelled());
        drop(tokens);
        first.abort();
    }

    #[tokio::test]
    async fn test_update_key_refresh_failure_propagates() {
        let fake = Arc::new(FakeProvider::with_models(
            ProviderKind::OpenAi,
            Err(GenerationError::discovery(ProviderKind::OpenAi, "down")),
        ));
        let (service, store) = service_with(vec![fake]);
        let result = service.update_key(ProviderKind::OpenAi, "sk-test").await;
        assert!(matches!(result, Err(GenerationError::Discovery { .. })));
        // Key 本身已持久化，失败只发生在后续刷新
        assert_eq!(store.snapshot().openai_api_key.as_deref(), Some("sk-test"));
    }

    #[tokio::test]
    async fn test_update_key_success_replaces_catalog() {
        let fake = Arc::new(FakeProvider::with_models(
            ProviderKind::OpenAi,
            Ok(vec![model(ProviderKind::OpenAi, "gpt-4")]),
        ));
        let (service, store) = service_with(vec![fake]);
        service
            .update_key(ProviderKind::OpenAi, "sk-test")
            .await
            .expect("update key");
        let snapshot = store.snapshot();
        assert_eq!(snapshot.available_models.len(), 1);
        assert!(snapshot.last_models_fetch.is_some());
    }

    #[tokio::test]
    async fn test_forced_refresh_fully_replaces_provider_models() {
        let fake = Arc::new(FakeProvider::with_models(
            ProviderKind::OpenAi,
            Ok(vec![
                model(ProviderKind::OpenAi, "gpt-4o"),
                model(ProviderKind::OpenAi, "gpt-4-turbo"),
            ]),
        ));
        let (service, store) = service_with(vec![fake]);
        store
            .update(
                1,
                &SettingsPatch {
                    available_models: Some(vec![
                        model(ProviderKind::OpenAi, "gpt-3.5-turbo"),
                        model(ProviderKind::Gemini, "gemini-1.5-flash"),
                    ]),
                    ..Default::default()
                },
            )
            .expect("seed cache");

        let view = service
            .get_available_models(Some(ProviderKind::OpenAi), true)
            .await
            .expect("refresh");
        let ids: Vec<_> = view.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["gpt-4o", "gpt-4-turbo"]);

        // gemini 的缓存条目保持原样，openai 的旧条目被整体替换
        let snapshot = store.snapshot();
        assert!(snapshot
            .available_models
            .iter()
            .any(|m| m.id == "gemini-1.5-flash"));
        assert!(!snapshot
            .available_models
            .iter()
            .any(|m| m.id == "gpt-3.5-turbo"));
    }

    #[tokio::test]
    async fn test_forced_refresh_masks_discovery_failure_as_empty() {
        let fake = Arc::new(FakeProvider::with_models(
            ProviderKind::OpenAi,
            Err(GenerationError::discovery(ProviderKind::OpenAi, "down")),
        ));
        let (service, store) = service_with(vec![fake]);
        store
            .update(
                1,
                &SettingsPatch {
                    available_models: Some(vec![model(ProviderKind::OpenAi, "gpt-4")]),
                    ..Default::default()
                },
            )
            .expect("seed cache");

        // 后台式发现：失败降级为空列表，不上抛
        let view = service
            .get_available_models(Some(ProviderKind::OpenAi), true)
            .await
            .expect("masked refresh must not fail");
        assert!(view.is_empty());
    }

    #[tokio::test]
    async fn test_get_models_without_refresh_serves_store_cache() {
        let (service, store) = service_with(vec![Arc::new(FakeProvider::streaming(
            ProviderKind::OpenAi,
            &[],
        ))]);
        store
            .update(
                1,
                &SettingsPatch {
                    available_models: Some(vec![model(ProviderKind::OpenAi, "gpt-4")]),
                    ..Default::default()
                },
            )
            .expect("seed cache");
        let view = service
            .get_available_models(Some(ProviderKind::OpenAi), false)
            .await
            .expect("read");
        assert_eq!(view.len(), 1);
        let all = service.get_available_models(None, false).await.expect("read all");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_session_guard_clears_after_stream_drains() {
        let fake = Arc::new(FakeProvider::streaming(ProviderKind::Local, &["x"]));
        let (service, _) = service_with(vec![fake]);
        let response = service
            .generate(ProviderKind::Local, &user("hi"), "llama3:8b", 0.7, 256)
            .await
            .expect("generate");
        assert!(service.active.lock().expect("lock").is_some());
        body_text(response).await;
        assert!(service.active.lock().expect("lock").is_none());
    }
}
