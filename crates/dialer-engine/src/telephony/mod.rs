//! PBX transport: REST commands and the websocket event stream, grounded
//! in the original `telephony/ari_client.py` and in
//! `session-core`'s event-loop shape.

pub mod client;
pub mod events;
pub mod stream;

pub use client::AriClient;
pub use events::AriEvent;
pub use stream::AriEventStream;
