//! 滑动窗口限流器（进程内，按 key 计数）

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

/// 滑动窗口限流器。
///
/// 剪枝-计数-写入在同一临界区内完成，同一 key 上的并发调用不会交错，
/// 限额在负载下也不会被突破。
///
/// 计数存储不可用（锁中毒）时放行（fail-open）：普通接口的限流降级
/// 不应演变成整体不可用。认证失败锁定走 `BruteForceGuard`，那边是
/// fail-closed，两者的不对称是有意为之。
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    buckets: Mutex<HashMap<String, Vec<Instant>>>,
    sweep_threshold: usize,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            buckets: Mutex::new(HashMap::new()),
            sweep_threshold: 1024,
        }
    }

    /// 返回是否允许当前请求；超限返回 false。
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!(key = %key, "rate limit store unavailable, failing open");
                return true;
            }
        };
        let entry = buckets.entry(key.to_string()).or_default();
        entry.retain(|t| now.duration_since(*t) < self.window);
        let allowed = if entry.len() >= self.limit {
            false
        } else {
            entry.push(now);
            true
        };
        // 清理空桶，避免无限增长
        if entry.is_empty() {
            buckets.remove(key);
        }
        // 当 bucket 过多时触发全量清理
        if buckets.len() > self.sweep_threshold {
            buckets.retain(|_, times| {
                times.retain(|t| now.duration_since(*t) < self.window);
                !times.is_empty()
            });
        }
        allowed
    }

    /// 检查是否超限（不记录）
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let buckets = match self.buckets.lock() {
            Ok(guard) => guard,
            Err(_) => {
                warn!(key = %key, "rate limit store unavailable, failing open");
                return true;
            }
        };
        if let Some(entry) = buckets.get(key) {
            let valid_count = entry
                .iter()
                .filter(|t| now.duration_since(**t) < self.window)
                .count();
            valid_count < self.limit
        } else {
            true
        }
    }

    /// 超限时距离窗口内最早一次记录滑出还需等待的秒数；未超限返回 None
    pub fn retry_after(&self, key: &str) -> Option<u64> {
        let now = Instant::now();
        let buckets = self.buckets.lock().ok()?;
        let entry = buckets.get(key)?;
        let valid: Vec<Instant> = entry
            .iter()
            .copied()
            .filter(|t| now.duration_since(*t) < self.window)
            .collect();
        if valid.len() < self.limit {
            return None;
        }
        let oldest = valid.iter().min()?;
        let remaining = self.window.saturating_sub(now.duration_since(*oldest));
        Some(remaining.as_secs().max(1))
    }
}
