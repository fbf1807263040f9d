use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[async_trait]
pub trait Shutdown: Send + Sync {
    async fn shutdown(&self) -> Result<()>;
}

/// Owns the root cancellation token; relay and consumer tasks hold child tokens.
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[async_trait]
impl Shutdown for ShutdownManager {
    async fn shutdown(&self) -> Result<()> {
        if !self.token.is_cancelled() {
            info!("Shutdown requested, stopping background tasks");
            self.token.cancel();
        }
        Ok(())
    }
}
