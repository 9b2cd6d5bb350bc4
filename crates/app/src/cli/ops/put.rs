use clap::Args;

use common::prelude::CallError;

use crate::cli::op::{ContextError, OpContext};

#[derive(Args, Debug, Clone)]
pub struct Put {
    pub key: String,
    pub value: String,

    /// Lease to attach the key to; 0 stores it without one
    #[arg(long, default_value_t = 0)]
    pub ttl: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum PutError {
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("put failed: {0}")]
    Call(#[from] CallError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Put {
    type Error = PutError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let (client, _events) = ctx.connect().await?;
        let result = client
            .put(self.key.as_str(), self.value.as_str(), self.ttl)
            .await;
        client.close().await;
        let header = result?;

        tracing::info!(key = %self.key, revision = header.revision, "stored");
        Ok(format!("OK (revision {})", header.revision))
    }
}
