//! netmix - low latency networked audio mixing
//!
//! provides the pieces to build a mixing server (collects audio from every connected
//! client, mixes a personal stereo feed for each of them and sends it back) and a client
//! that streams its local audio to that server and plays the returned mix.
extern crate json;
#[macro_use]
extern crate num_derive;

pub mod common;
pub mod server;
pub mod sound;
