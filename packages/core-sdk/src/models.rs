use serde::{Deserialize, Serialize};

/**
 * \brief Provider 类型标识，注册表与设置行均以此为键。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /** \brief 本地推理服务（OpenAI 兼容接口） */
    Local,
    /** \brief OpenAI 官方接口 */
    OpenAi,
    /** \brief OpenRouter（复用 OpenAI 报文格式） */
    OpenRouter,
    /** \brief Google Gemini */
    Gemini,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Local,
        ProviderKind::OpenAi,
        ProviderKind::OpenRouter,
        ProviderKind::Gemini,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::OpenAi => "openai",
            ProviderKind::OpenRouter => "openrouter",
            ProviderKind::Gemini => "gemini",
        }
    }

    /**
     * \brief 从设置/请求中的字符串解析 Provider 类型。
     */
    pub fn parse(value: &str) -> Option<ProviderKind> {
        match value.to_ascii_lowercase().as_str() {
            "local" => Some(ProviderKind::Local),
            "openai" => Some(ProviderKind::OpenAi),
            "openrouter" => Some(ProviderKind::OpenRouter),
            "gemini" | "google" => Some(ProviderKind::Gemini),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/**
 * \brief 模型目录条目，身份由 (provider, id) 共同确定，发现后不可变。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    /** \brief 后端返回的模型 ID */
    pub id: String,
    /** \brief 展示名称 */
    pub name: String,
    /** \brief 所属 Provider */
    pub provider: ProviderKind,
    /** \brief 上下文长度（token） */
    pub context_length: u32,
    /** \brief 是否在界面可选 */
    pub enabled: bool,
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐；调用方只读传入。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：system/user/assistant */
    pub role: String,
    /** \brief 内容 */
    pub content: String,
}

/**
 * \brief 设置单例（数据库中固定 id=1 的一行），是凭据与模型缓存的事实来源。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /** \brief 固定为 1 */
    pub id: i64,
    /** \brief OpenAI API Key */
    pub openai_api_key: Option<String>,
    /** \brief OpenRouter API Key */
    pub openrouter_api_key: Option<String>,
    /** \brief Gemini API Key */
    pub gemini_api_key: Option<String>,
    /** \brief 本地推理服务基地址 */
    pub local_api_url: String,
    /** \brief 缓存的模型目录 */
    pub available_models: Vec<Model>,
    /** \brief 最近一次模型发现时间（RFC3339） */
    pub last_models_fetch: Option<String>,
    /** \brief 各 Provider 的默认模型 ID */
    pub default_local_model: Option<String>,
    pub default_openai_model: Option<String>,
    pub default_openrouter_model: Option<String>,
    pub default_gemini_model: Option<String>,
}

impl Settings {
    /**
     * \brief 读取指定 Provider 的已存凭据（本地服务不需要凭据，恒为 None）。
     */
    pub fn credential_for(&self, kind: ProviderKind) -> Option<&str> {
        match kind {
            ProviderKind::Local => None,
            ProviderKind::OpenAi => self.openai_api_key.as_deref(),
            ProviderKind::OpenRouter => self.openrouter_api_key.as_deref(),
            ProviderKind::Gemini => self.gemini_api_key.as_deref(),
        }
    }
}

/**
 * \brief 设置的部分更新载荷；None 字段保持原值，绝不整行替换。
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsPatch {
    pub openai_api_key: Option<String>,
    pub openrouter_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub local_api_url: Option<String>,
    pub available_models: Option<Vec<Model>>,
    pub last_models_fetch: Option<String>,
    pub default_local_model: Option<String>,
    pub default_openai_model: Option<String>,
    pub default_openrouter_model: Option<String>,
    pub default_gemini_model: Option<String>,
}

impl SettingsPatch {
    /**
     * \brief 仅更新指定 Provider 的凭据字段。
     */
    pub fn with_credential(kind: ProviderKind, key: &str) -> SettingsPatch {
        let mut patch = SettingsPatch::default();
        match kind {
            ProviderKind::Local => {}
            ProviderKind::OpenAi => patch.openai_api_key = Some(key.to_string()),
            ProviderKind::OpenRouter => patch.openrouter_api_key = Some(key.to_string()),
            ProviderKind::Gemini => patch.gemini_api_key = Some(key.to_string()),
        }
        patch
    }

    /**
     * \brief 仅更新指定 Provider 的默认模型字段。
     */
    pub fn with_default_model(kind: ProviderKind, model_id: &str) -> SettingsPatch {
        let mut patch = SettingsPatch::default();
        let value = Some(model_id.to_string());
        match kind {
            ProviderKind::Local => patch.default_local_model = value,
            ProviderKind::OpenAi => patch.default_openai_model = value,
            ProviderKind::OpenRouter => patch.default_openrouter_model = value,
            ProviderKind::Gemini => patch.default_gemini_model = value,
        }
        patch
    }
}
