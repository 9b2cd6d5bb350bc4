//! Wire types for the JSON-over-WebSocket gateway protocol
//!
//! ```text
//! client -> server  {id, action, key?, endkey?, val?, lease?, limit?, prefix?}
//! server -> client  {id, action, success: true,  key, event}
//!                   {id, action, success: false, key, err}
//!                   {action: "watch", success: true, key, event: {type, header, kvs, prev_kv?}}
//! ```
//!
//! Keys and values are base64 on the wire and plain bytes everywhere else.

pub mod encoding;
mod frame;
mod record;

pub use frame::{Action, CallRequest, FrameError, RequestFrame, ResponseFrame};
pub use record::{ChangeEvent, ChangeKind, EventPayload, Record, ResponseHeader};
