use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// State of one logical call, shared by all of its physical attempts.
#[derive(Debug, Clone)]
pub struct CallContext {
    request_id: String,
    refresh_attempted: bool,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self {
            request_id: format!("agent-{}", Uuid::new_v4()),
            refresh_attempted: false,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Stable across retries and endpoint fallback.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn refresh_attempted(&self) -> bool {
        self.refresh_attempted
    }

    pub fn mark_refresh_attempted(&mut self) {
        self.refresh_attempted = true;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether waiting `delay` from now would run past the deadline
    pub fn would_outlive(&self, delay: Duration) -> bool {
        self.deadline
            .is_some_and(|deadline| Instant::now() + delay > deadline)
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique_and_prefixed() {
        let a = CallContext::new();
        let b = CallContext::new();
        assert!(a.request_id().starts_with("agent-"));
        assert_ne!(a.request_id(), b.request_id());
    }

    #[test]
    fn test_refresh_flag() {
        let mut ctx = CallContext::new();
        assert!(!ctx.refresh_attempted());
        ctx.mark_refresh_attempted();
        assert!(ctx.refresh_attempted());
        assert!(ctx.clone().refresh_attempted());
    }

    #[tokio::test]
    async fn test_would_outlive() {
        let ctx = CallContext::new();
        assert!(!ctx.would_outlive(Duration::from_secs(3600)));

        let ctx = CallContext::new().with_timeout(Duration::from_secs(1));
        assert!(ctx.would_outlive(Duration::from_secs(60)));
        assert!(!ctx.would_outlive(Duration::from_millis(10)));
    }
}
