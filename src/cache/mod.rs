pub mod fingerprint;
pub mod memory;

use std::future::Future;
use std::pin::Pin;

use axum::body::Bytes;
use chrono::{DateTime, Utc};

use crate::error::Result;

pub use fingerprint::{VARY_HEADERS, fingerprint};
pub use memory::MemoryCache;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A complete upstream reply kept for replay.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub provider_id: String,
    pub provider_name: String,
    pub upstream_model: Option<String>,
    pub stored_at: DateTime<Utc>,
}

// 响应缓存抽象（内存 LRU 为默认实现，可替换为其他存储）
pub trait ResponseCache: Send + Sync {
    fn get<'a>(&'a self, fingerprint: &'a str) -> BoxFuture<'a, Result<Option<CachedResponse>>>;
    fn put<'a>(&'a self, fingerprint: String, response: CachedResponse) -> BoxFuture<'a, Result<()>>;
    fn clear<'a>(&'a self) -> BoxFuture<'a, Result<()>>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
