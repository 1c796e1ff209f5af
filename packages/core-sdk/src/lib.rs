pub mod db;
pub mod error;
pub mod generation;
pub mod models;
pub mod providers;
pub mod server;
pub mod stream;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::db;
    pub use crate::error;
    pub use crate::generation;
    pub use crate::models;
    pub use crate::providers;
    pub use crate::server;
    pub use crate::stream;
    pub use crate::telemetry;
}
