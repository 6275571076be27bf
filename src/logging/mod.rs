pub mod database;
pub mod recorder;
pub mod time;
pub mod types;

pub use database::DatabaseLogger;
pub use recorder::RequestRecorder;
pub use types::RequestLog;
