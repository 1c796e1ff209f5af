use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::models::{Message, Model, ProviderKind};
use crate::stream::FragmentStream;
use crate::telemetry;

mod gemini;
mod openai;

pub use gemini::GeminiProvider;
pub use openai::ChatCompletionsProvider;

/**
 * \brief 统一的 Provider 契约：四个操作，各后端的 SDK 差异被完全封装在实现内。
 */
#[async_trait]
pub trait AiProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /**
     * \brief 幂等初始化；凭据缺失时为 no-op。
     * \details 对本地服务而言"凭据"即其基地址，其余 Provider 为 API Key。
     */
    fn initialize(&self, credential: Option<&str>);

    /** \brief 客户端是否已就绪。 */
    fn is_initialized(&self) -> bool;

    /**
     * \brief 可失败的模型发现，供用户主动触发的刷新使用（失败上抛）。
     */
    async fn try_fetch_models(&self) -> Result<Vec<Model>>;

    /**
     * \brief 掩蔽失败的模型发现：任何失败记日志并返回空列表，绝不抛出。
     * \details 目录坏了不能挡住一个已配置、本来可用的 Provider。
     */
    async fn fetch_models(&self) -> Vec<Model> {
        match self.try_fetch_models().await {
            Ok(models) => models,
            Err(err) => {
                telemetry::log_error(
                    "models",
                    &format!("{} discovery failed: {}", self.kind(), err),
                );
                Vec::new()
            }
        }
    }

    /**
     * \brief 发起一次生成，返回规范化片段流。
     * \details `cancel` 触发后必须尽快释放传输资源，无论是否已产出片段；
     * 取消以类型化的 Cancelled 变体出现，不做错误名字符串匹配。
     */
    async fn generate(
        &self,
        messages: &[Message],
        model_id: &str,
        temperature: f32,
        max_tokens: u32,
        cancel: CancellationToken,
    ) -> Result<FragmentStream>;
}

/**
 * \brief Provider 注册表：按类型标签映射到各自的单例实现。
 */
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn AiProvider>>,
}

impl ProviderRegistry {
    /**
     * \brief 构建全部四个内建 Provider。
     */
    pub fn new() -> ProviderRegistry {
        let providers: Vec<Arc<dyn AiProvider>> = vec![
            Arc::new(ChatCompletionsProvider::local()),
            Arc::new(ChatCompletionsProvider::openai()),
            Arc::new(ChatCompletionsProvider::openrouter()),
            Arc::new(GeminiProvider::new()),
        ];
        ProviderRegistry::from_providers(providers)
    }

    /**
     * \brief 用外部给定的实现组装注册表（测试注入替身也走这里）。
     */
    pub fn from_providers(providers: Vec<Arc<dyn AiProvider>>) -> ProviderRegistry {
        let providers = providers.into_iter().map(|p| (p.kind(), p)).collect();
        ProviderRegistry { providers }
    }

    pub fn get(&self, kind: ProviderKind) -> Arc<dyn AiProvider> {
        self.providers
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| panic!("provider {} not registered", kind))
    }

    /**
     * \brief 以给定凭据（重新）初始化指定 Provider。
     */
    pub fn initialize(&self, kind: ProviderKind, credential: Option<&str>) {
        self.get(kind).initialize(credential);
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        ProviderRegistry::new()
    }
}
