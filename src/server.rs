//! things used to make the mixing server
//!
//! Three threads share one UDP socket:
//! - accept: reads datagrams, sorts audio into a queue per sender, routes control messages
//! - mixer: waits until every sender has enough buffered, pops one block from each and
//!   builds a personal stereo mix for every receiver
//! - send: puts the mixes (plus the occasional ClientInfo / SessionSetup) on the wire
pub mod accept_thread;
pub mod client_registry;
pub mod mix_server;
pub mod mixer_thread;
pub mod remote_volume;
pub mod send_thread;
pub mod session_types;
