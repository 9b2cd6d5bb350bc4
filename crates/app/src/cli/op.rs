use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::broadcast;
use url::Url;

use common::config::ConfigError;
use common::prelude::*;

use crate::state::AppState;

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("no connection string: pass --dsn, set EPAD_DSN or add `dsn` to the config file")]
    MissingDsn,
    #[error("invalid connection string: {0}")]
    InvalidDsn(#[from] ConfigError),
    #[error("could not reach {backend} within {timeout:?}")]
    Unreachable { backend: Url, timeout: Duration },
    #[error("client closed before connecting")]
    Closed,
}

/// Resolve the gateway URL.
///
/// Priority: explicit `--backend` flag > config file `backend` (which
///  defaults to ws://localhost:8080/).
pub fn resolve_backend(explicit: Option<Url>, state: &AppState) -> Url {
    explicit.unwrap_or_else(|| state.config.backend.clone())
}

/// Priority: `--dsn` flag or `EPAD_DSN` > config file `dsn`.
pub fn resolve_dsn(explicit: Option<String>, state: &AppState) -> Option<String> {
    explicit
        .filter(|dsn| !dsn.trim().is_empty())
        .or_else(|| state.config.dsn.clone())
}

#[derive(Debug, Clone)]
pub struct OpContext {
    pub backend: Url,
    pub dsn: Option<String>,
    pub client_config: ClientConfig,
    /// Config file the settings came from, whether or not it exists
    pub config_path: PathBuf,
}

impl OpContext {
    pub fn new(backend: Option<Url>, dsn: Option<String>, state: AppState) -> Self {
        Self {
            backend: resolve_backend(backend, &state),
            dsn: resolve_dsn(dsn, &state),
            client_config: state.config.client,
            config_path: state.config_path,
        }
    }

    pub fn endpoint(&self) -> Result<EndpointConfig, ContextError> {
        let dsn = self.dsn.as_deref().ok_or(ContextError::MissingDsn)?;
        Ok(EndpointConfig::parse(dsn)?)
    }

    /// Open a session and wait for the first connection.
    ///
    /// The client retries on its own, so an unreachable gateway is only
    ///  noticed by the connect timeout.
    pub async fn connect(
        &self,
    ) -> Result<(Client, broadcast::Receiver<SessionEvent>), ContextError> {
        let endpoint = self.endpoint()?;
        tracing::debug!(backend = %self.backend, endpoint = %endpoint, "opening session");

        let connector = WebSocketConnector::new(self.backend.clone());
        let (client, events) = Client::connect(endpoint, self.client_config.clone(), connector);

        let timeout = self.client_config.connect_timeout();
        match tokio::time::timeout(timeout, client.wait_connected()).await {
            Ok(Ok(())) => Ok((client, events)),
            Ok(Err(_)) => Err(ContextError::Closed),
            Err(_) => {
                client.close().await;
                Err(ContextError::Unreachable {
                    backend: self.backend.clone(),
                    timeout,
                })
            }
        }
    }
}

#[async_trait::async_trait]
pub trait Op: Send + Sync {
    type Error: Error + Send + Sync + 'static;
    type Output;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error>;
}

#[macro_export]
macro_rules! command_enum {
    ($(($variant:ident, $type:ty)),* $(,)?) => {
        #[derive(Subcommand, Debug, Clone)]
        pub enum Command {
            $($variant($type),)*
        }

        #[derive(Debug)]
        pub enum OpOutput {
            $($variant(<$type as $crate::cli::op::Op>::Output),)*
        }

        #[derive(Debug, thiserror::Error)]
        pub enum OpError {
            $(
                #[error(transparent)]
                $variant(<$type as $crate::cli::op::Op>::Error),
            )*
        }

        #[async_trait::async_trait]
        impl $crate::cli::op::Op for Command {
            type Output = OpOutput;
            type Error = OpError;

            async fn execute(&self, ctx: &$crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
                match self {
                    $(
                        Command::$variant(op) => {
                            op.execute(ctx).await
                                .map(OpOutput::$variant)
                                .map_err(OpError::$variant)
                        },
                    )*
                }
            }
        }

        impl std::fmt::Display for OpOutput {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(
                        OpOutput::$variant(output) => write!(f, "{}", output),
                    )*
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppConfig;

    fn state(backend: &str, dsn: Option<&str>) -> AppState {
        AppState {
            config_path: PathBuf::from("/nonexistent/config.toml"),
            config: AppConfig {
                backend: Url::parse(backend).unwrap(),
                dsn: dsn.map(str::to_string),
                ..AppConfig::default()
            },
        }
    }

    #[test]
    fn test_explicit_backend_wins() {
        let explicit = Url::parse("wss://gw.example.com/ws").unwrap();
        let state = state("ws://localhost:9000/", None);
        assert_eq!(resolve_backend(Some(explicit.clone()), &state), explicit);
        assert_eq!(
            resolve_backend(None, &state).as_str(),
            "ws://localhost:9000/"
        );
    }

    #[test]
    fn test_dsn_falls_back_to_config() {
        let state = state("ws://localhost:8080/", Some("etcd://10.0.0.1:2379"));
        assert_eq!(
            resolve_dsn(Some("etcd://other:2379".into()), &state).as_deref(),
            Some("etcd://other:2379")
        );
        assert_eq!(
            resolve_dsn(Some("  ".into()), &state).as_deref(),
            Some("etcd://10.0.0.1:2379")
        );
        assert_eq!(
            resolve_dsn(None, &state).as_deref(),
            Some("etcd://10.0.0.1:2379")
        );
    }

    #[test]
    fn test_endpoint_requires_a_dsn() {
        let ctx = OpContext::new(None, None, state("ws://localhost:8080/", None));
        assert!(matches!(ctx.endpoint(), Err(ContextError::MissingDsn)));

        let ctx = OpContext::new(
            None,
            Some("etcd://h:1/app".into()),
            state("ws://localhost:8080/", None),
        );
        assert_eq!(ctx.endpoint().unwrap().prefix(), "/app");

        let ctx = OpContext::new(
            None,
            Some("etcd://a:1,,b:2".into()),
            state("ws://localhost:8080/", None),
        );
        assert!(matches!(ctx.endpoint(), Err(ContextError::InvalidDsn(_))));
    }
}
