use crate::config::RateLimitConfig;
use crate::models::WorkspaceId;
use crate::{Error, Result};
use dashmap::DashMap;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Fixed-window admission control for enrichment, keyed by workspace.
///
/// Never waits: an exhausted window fails with `Error::RateLimited`.
pub struct WorkspaceRateLimiter {
    config: RateLimitConfig,
    windows: DashMap<WorkspaceId, Window>, // workspace -> current window
}

impl WorkspaceRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    pub fn check(&self, workspace_id: WorkspaceId) -> Result<()> {
        let now = Instant::now();
        let mut entry = self.windows.entry(workspace_id).or_insert(Window {
            started: now,
            count: 0,
        });
        let window = entry.value_mut();
        if now.duration_since(window.started) >= self.config.window {
            *window = Window {
                started: now,
                count: 0,
            };
        }
        if window.count >= self.config.max_requests {
            let retry_in = self
                .config
                .window
                .saturating_sub(now.duration_since(window.started));
            tracing::debug!(%workspace_id, retry_in_ms = retry_in.as_millis() as u64, "enrichment rate limited");
            return Err(Error::RateLimited(format!(
                "workspace enrichment limit of {} per {}s reached; retry in {}s",
                self.config.max_requests,
                self.config.window.as_secs(),
                retry_in.as_secs().max(1)
            )));
        }
        window.count += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(max: u32) -> WorkspaceRateLimiter {
        WorkspaceRateLimiter::new(RateLimitConfig {
            max_requests: max,
            window: Duration::from_secs(60),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn limits_per_workspace_and_resets_after_window() {
        let limiter = limiter(2);
        let ws = WorkspaceId::new();

        assert!(limiter.check(ws).is_ok());
        assert!(limiter.check(ws).is_ok());
        assert!(matches!(limiter.check(ws), Err(Error::RateLimited(_))));

        // Other workspaces have their own budget.
        assert!(limiter.check(WorkspaceId::new()).is_ok());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check(ws).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn default_allows_ten_per_minute() {
        let limiter = WorkspaceRateLimiter::new(RateLimitConfig::default());
        let ws = WorkspaceId::new();
        for _ in 0..10 {
            limiter.check(ws).unwrap();
        }
        assert!(limiter.check(ws).is_err());
    }
}
