use clap::Args;

use common::client::ScanAborted;

use crate::cli::op::{ContextError, OpContext};

#[derive(Args, Debug, Clone)]
pub struct Ls {
    /// Key prefix to list (defaults to the connection string's prefix)
    pub prefix: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum LsError {
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Scan(#[from] ScanAborted),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Ls {
    type Error = LsError;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let (client, _events) = ctx.connect().await?;
        let scan = match &self.prefix {
            Some(prefix) => client.get_prefix(prefix),
            None => client.scan_endpoint(),
        };
        let result = scan.collect().await;
        client.close().await;
        let records = result?;

        if records.is_empty() {
            return Ok("No keys found".to_string());
        }
        Ok(records
            .iter()
            .map(|record| record.key_text().into_owned())
            .collect::<Vec<_>>()
            .join("\n"))
    }
}
