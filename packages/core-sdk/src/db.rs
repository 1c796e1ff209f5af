use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::PathBuf;
use std::{thread, time::Duration};

use crate::error::{GenerationError, Result};
use crate::models::{Model, Settings, SettingsPatch};

/** \brief 设置单例行的固定主键。 */
pub const SETTINGS_ROW_ID: i64 = 1;

/** \brief 本地推理服务的默认地址（OpenAI 兼容接口）。 */
pub const DEFAULT_LOCAL_API_URL: &str = "http://localhost:11434/v1";

/**
 * \brief 设置存储边界。存储是事实来源，任何要求新鲜度的读取都应重新拉取。
 * \details 读写失败一律上抛（静默丢数据不可接受）；与模型发现的降级策略相反。
 */
pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<Settings>;
    fn update(&self, id: i64, patch: &SettingsPatch) -> Result<()>;
}

/**
 * \brief 基于 SQLite 的设置存储；每次操作新开连接，靠 busy_timeout 与锁重试兜底。
 */
pub struct SqliteSettingsStore {
    path: PathBuf,
}

impl SqliteSettingsStore {
    /**
     * \brief 打开指定路径的数据库并完成迁移。
     */
    pub fn open(path: impl Into<PathBuf>) -> Result<SqliteSettingsStore> {
        let store = SqliteSettingsStore { path: path.into() };
        let conn = store.connect()?;
        migrate(&conn)?;
        Ok(store)
    }

    /**
     * \brief 打开默认数据库文件（本地目录下的 storyloom.db，可用环境变量覆盖）。
     */
    pub fn open_default() -> Result<SqliteSettingsStore> {
        let path = std::env::var("STORYLOOM_DB").unwrap_or_else(|_| "storyloom.db".to_string());
        SqliteSettingsStore::open(path)
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(conn)
    }
}

impl SettingsStore for SqliteSettingsStore {
    fn load(&self) -> Result<Settings> {
        let conn = self.connect()?;
        get_settings(&conn)
    }

    fn update(&self, id: i64, patch: &SettingsPatch) -> Result<()> {
        let conn = self.connect()?;
        update_settings(&conn, id, patch)
    }
}

/**
 * \brief 运行数据库迁移，创建设置表并保证单例行存在。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS settings (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            openai_api_key TEXT,
            openrouter_api_key TEXT,
            gemini_api_key TEXT,
            local_api_url TEXT NOT NULL DEFAULT 'http://localhost:11434/v1',
            available_models TEXT NOT NULL DEFAULT '[]',
            last_models_fetch TEXT,
            default_local_model TEXT,
            default_openai_model TEXT,
            default_openrouter_model TEXT,
            default_gemini_model TEXT
        );
        "#,
        )
    })?;

    ensure_settings_column(conn, "openrouter_api_key", "TEXT")?;
    ensure_settings_column(conn, "last_models_fetch", "TEXT")?;
    ensure_settings_column(conn, "default_local_model", "TEXT")?;
    ensure_settings_column(conn, "default_openai_model", "TEXT")?;
    ensure_settings_column(conn, "default_openrouter_model", "TEXT")?;
    ensure_settings_column(conn, "default_gemini_model", "TEXT")?;

    retry_on_locked(|| {
        conn.execute(
            "INSERT OR IGNORE INTO settings (id, local_api_url) VALUES (?1, ?2)",
            params![SETTINGS_ROW_ID, DEFAULT_LOCAL_API_URL],
        )
    })?;
    Ok(())
}

fn ensure_settings_column(conn: &Connection, column: &str, decl: &str) -> Result<()> {
    let mut stmt = conn.prepare("PRAGMA table_info(settings)")?;
    let mut rows = stmt.query([])?;
    let mut has = false;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            has = true;
            break;
        }
    }
    if !has {
        let sql = format!("ALTER TABLE settings ADD COLUMN {} {}", column, decl);
        retry_on_locked(|| conn.execute(&sql, []))?;
    }
    Ok(())
}

/**
 * \brief 读取设置单例行。迁移保证该行存在，缺失视为持久化错误。
 */
pub fn get_settings(conn: &Connection) -> Result<Settings> {
    let row = conn
        .query_row(
            "SELECT id, openai_api_key, openrouter_api_key, gemini_api_key, local_api_url,
                    available_models, last_models_fetch, default_local_model,
                    default_openai_model, default_openrouter_model, default_gemini_model
             FROM settings WHERE id=?1",
            params![SETTINGS_ROW_ID],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, Option<String>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, Option<String>>(10)?,
                ))
            },
        )
        .optional()?
        .ok_or_else(|| GenerationError::Persistence("settings row missing".to_string()))?;

    let models: Vec<Model> = serde_json::from_str(&row.5)
        .map_err(|e| GenerationError::Persistence(format!("decode available_models: {}", e)))?;

    Ok(Settings {
        id: row.0,
        openai_api_key: row.1,
        openrouter_api_key: row.2,
        gemini_api_key: row.3,
        local_api_url: row.4,
        available_models: models,
        last_models_fetch: row.6,
        default_local_model: row.7,
        default_openai_model: row.8,
        default_openrouter_model: row.9,
        default_gemini_model: row.10,
    })
}

/**
 * \brief 按补丁部分更新设置行；补丁中为 None 的字段一律保持原值。
 */
pub fn update_settings(conn: &Connection, id: i64, patch: &SettingsPatch) -> Result<()> {
    let mut sets: Vec<String> = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    let mut push = |column: &str, value: Box<dyn rusqlite::ToSql>, sets: &mut Vec<String>| {
        sets.push(format!("{}=?{}", column, values.len() + 1));
        values.push(value);
    };

    if let Some(v) = &patch.openai_api_key {
        push("openai_api_key", Box::new(v.clone()), &mut sets);
    }
    if let Some(v) = &patch.openrouter_api_key {
        push("openrouter_api_key", Box::new(v.clone()), &mut sets);
    }
    if let Some(v) = &patch.gemini_api_key {
        push("gemini_api_key", Box::new(v.clone()), &mut sets);
    }
    if let Some(v) = &patch.local_api_url {
        push("local_api_url", Box::new(v.clone()), &mut sets);
    }
    if let Some(models) = &patch.available_models {
        let encoded = serde_json::to_string(models)
            .map_err(|e| GenerationError::Persistence(format!("encode available_models: {}", e)))?;
        push("available_models", Box::new(encoded), &mut sets);
    }
    if let Some(v) = &patch.last_models_fetch {
        push("last_models_fetch", Box::new(v.clone()), &mut sets);
    }
    if let Some(v) = &patch.default_local_model {
        push("default_local_model", Box::new(v.clone()), &mut sets);
    }
    if let Some(v) = &patch.default_openai_model {
        push("default_openai_model", Box::new(v.clone()), &mut sets);
    }
    if let Some(v) = &patch.default_openrouter_model {
        push("default_openrouter_model", Box::new(v.clone()), &mut sets);
    }
    if let Some(v) = &patch.default_gemini_model {
        push("default_gemini_model", Box::new(v.clone()), &mut sets);
    }

    if sets.is_empty() {
        return Ok(());
    }

    let sql = format!(
        "UPDATE settings SET {} WHERE id=?{}",
        sets.join(", "),
        values.len() + 1
    );
    values.push(Box::new(id));

    let rows = retry_on_locked(|| {
        conn.execute(&sql, rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())))
    })?;
    if rows == 0 {
        return Err(GenerationError::Persistence(format!(
            "settings row {} not found",
            id
        )));
    }
    Ok(())
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    for attempt in 0..=MAX_RETRIES {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                let backoff = Duration::from_millis(200 * (attempt as u64 + 1));
                thread::sleep(backoff);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("retry_on_locked should have returned within the loop");
}
