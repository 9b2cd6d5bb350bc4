/**
 * Bounded, closable FIFO used to stream records
 *  from a range scan to its consumer.
 */
pub mod channel;
/**
 * Connection to the store gateway.
 *  - Connection lifecycle and reconnection
 *  - Call correlation and timeouts
 *  - Paginated prefix scans
 */
pub mod client;
/**
 * Endpoint (DSN) parsing and client tunables.
 */
pub mod config;
/**
 * Orchestration that keeps a key tree in step
 *  with the store: full reloads on (re)connect
 *  and ordered application of watch events.
 */
pub mod sync;
/**
 * In-memory connector and store server for tests.
 */
pub mod testkit;
/**
 * Hierarchical projection of the flat,
 *  slash-delimited key namespace.
 */
pub mod tree;
/**
 * Frame, record and event types exchanged with
 *  the gateway, and the base64 encoding used
 *  for keys and values.
 */
pub mod wire;

pub mod prelude {
    pub use crate::channel::{Channel, ChannelError, ChannelState, CloseReason};
    pub use crate::client::{
        CallError, Client, ConnectionState, Connector, RangeScan, SessionEvent,
        WebSocketConnector,
    };
    pub use crate::config::{ClientConfig, EndpointConfig, InFlightPolicy};
    pub use crate::sync::{TreeHandle, TreeSync};
    pub use crate::tree::{DuplicatePolicy, KeyTree, NodeKind, TreeError, TreeNode};
    pub use crate::wire::{Action, ChangeEvent, Record, ResponseHeader};
}
