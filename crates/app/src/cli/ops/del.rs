use clap::Args;

use common::prelude::CallError;

use crate::cli::op::{ContextError, OpContext};

#[derive(Args, Debug, Clone)]
pub struct Del {
    pub key: String,

    /// Delete every key that starts with KEY
    #[arg(long)]
    pub prefix: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DelError {
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("delete failed: {0}")]
    Call(#[from] CallError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Del {
    type Error = DelError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let (client, _events) = ctx.connect().await?;
        let result = client.del(self.key.as_str(), self.prefix).await;
        client.close().await;
        let header = result?;

        Ok(format!("Deleted (revision {})", header.revision))
    }
}
