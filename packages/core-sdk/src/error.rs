use crate::models::ProviderKind;

/**
 * \brief 生成核心的错误分类。
 * \details 分类决定对外可见性：配置与持久化错误必须抛给调用方；
 *          取消在公共边界统一换成 204 哨兵；发现失败只记日志并降级为空列表。
 */
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    /** \brief 凭据缺失或客户端未初始化。 */
    #[error("{0} has no API key configured; save a credential in settings first")]
    Configuration(ProviderKind),

    /** \brief 设置读写失败。 */
    #[error("settings persistence failed: {0}")]
    Persistence(String),

    /** \brief 网络或 SSE 报文错误，经由流本身的错误通道上抛。 */
    #[error("transport error: {0}")]
    Transport(String),

    /** \brief 用户主动取消，不是失败。 */
    #[error("generation cancelled")]
    Cancelled,

    /** \brief 模型发现失败；调用链中只记录，不向 UI 抛出。 */
    #[error("model discovery failed for {provider}: {reason}")]
    Discovery {
        provider: ProviderKind,
        reason: String,
    },
}

impl GenerationError {
    pub fn transport(err: impl std::fmt::Display) -> GenerationError {
        GenerationError::Transport(err.to_string())
    }

    pub fn discovery(provider: ProviderKind, err: impl std::fmt::Display) -> GenerationError {
        GenerationError::Discovery {
            provider,
            reason: err.to_string(),
        }
    }

    /** \brief 是否为用户取消。 */
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GenerationError::Cancelled)
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        GenerationError::Transport(err.to_string())
    }
}

impl From<rusqlite::Error> for GenerationError {
    fn from(err: rusqlite::Error) -> Self {
        GenerationError::Persistence(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GenerationError>;
