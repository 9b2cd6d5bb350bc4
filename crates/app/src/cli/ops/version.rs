use clap::Args;

use crate::cli::op::OpContext;

#[derive(Args, Debug, Clone)]
pub struct Version;

#[async_trait::async_trait]
impl crate::cli::op::Op for Version {
    type Error = std::convert::Infallible;
    type Output = String;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        Ok(format!(
            "epad {} ({} build, {})\n\
             - Config: {}\n\
             - Backend: {}",
            env!("REPO_VERSION"),
            env!("BUILD_PROFILE"),
            env!("BUILD_TARGET"),
            ctx.config_path.display(),
            ctx.backend,
        ))
    }
}
