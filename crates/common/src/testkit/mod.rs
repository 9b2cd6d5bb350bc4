//! In-process stand-ins for the gateway, for tests
//!
//! [`MockConnector`] hands out in-memory links instead of sockets; the
//! server half of each link can be driven by hand through [`ServerLink`]
//! or served by a [`MemoryServer`].
//!
//! ```rust,ignore
//! use common::prelude::*;
//! use common::testkit::{MemoryServer, MockConnector};
//!
//! #[tokio::test]
//! async fn test_put_then_get() -> anyhow::Result<()> {
//!     let (connector, listener) = MockConnector::new();
//!     let server = MemoryServer::spawn(listener);
//!     let endpoint = EndpointConfig::parse("etcd://test:2379")?;
//!     let (client, _events) = Client::connect(endpoint, ClientConfig::default(), connector);
//!     client.wait_connected().await?;
//!
//!     client.put("/a", "1", 0).await?;
//!     let (record, _) = client.get("/a").await?;
//!     assert_eq!(record.value_text().as_deref(), Some("1"));
//!     assert_eq!(server.keys(), vec!["/a"]);
//!     Ok(())
//! }
//! ```
mod connector;
mod server;

pub use connector::{MockConnector, MockListener, ServerLink};
pub use server::MemoryServer;
