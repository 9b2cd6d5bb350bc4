use clap::Args;

use common::client::ScanAborted;
use common::prelude::*;

use crate::cli::op::{ContextError, OpContext};

#[derive(Args, Debug, Clone)]
pub struct Tree {
    /// Only project keys under this prefix
    #[arg(long)]
    pub prefix: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum TreeOpError {
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Scan(#[from] ScanAborted),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Tree {
    type Error = TreeOpError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let (client, _events) = ctx.connect().await?;
        let scan = match &self.prefix {
            Some(prefix) => client.get_prefix(prefix),
            None => client.scan_endpoint(),
        };

        let mut tree = KeyTree::new();
        while let Some(record) = scan.recv().await {
            let key = record.key_text().into_owned();
            if let Err(err) = tree.append_record(record) {
                tracing::warn!(key = %key.escape_debug(), error = %err, "skipping key");
            }
        }
        let aborted = scan.close_reason();
        client.close().await;

        if let Some(CloseReason::Aborted(message)) = aborted {
            return Err(ScanAborted(message).into());
        }
        Ok(tree.render().trim_end().to_string())
    }
}
