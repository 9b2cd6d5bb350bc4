use clap::Args;

use common::prelude::CallError;

use crate::cli::op::{ContextError, OpContext};

#[derive(Args, Debug, Clone)]
pub struct Get {
    /// Key to read
    pub key: String,

    /// Print revisions, version and lease after the value
    #[arg(long)]
    pub meta: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum GetError {
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("get failed: {0}")]
    Call(#[from] CallError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Get {
    type Error = GetError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let (client, _events) = ctx.connect().await?;
        let result = client.get(self.key.as_str()).await;
        client.close().await;
        let (record, header) = result?;

        let value = record.value_text().unwrap_or_default().into_owned();
        if !self.meta {
            return Ok(value);
        }
        Ok(format!(
            "{value}\n\
             - create_revision: {}\n\
             - mod_revision: {}\n\
             - version: {}\n\
             - lease: {}\n\
             - store revision: {}",
            record.create_revision, record.mod_revision, record.version, record.lease, header.revision
        ))
    }
}
