//! Chat relay that can run as several server instances behind one address.
//!
//! Clients connect over WebSocket, log in with a unique name and exchange
//! public or direct messages. Instances share presence, history and a
//! fan-out bus through a store (in-process or Redis), so every instance
//! sees every login, logout and message:
//!
//! - [`room`] derives the key of a direct conversation from two usernames.
//! - [`store`] defines the presence, history and fan-out traits plus the
//!   memory and Redis backends.
//! - [`registry`] tracks the sessions connected to this instance.
//! - [`router`] handles client requests and delivers fan-out events to the
//!   local sessions that should see them.
//! - [`server`] wires an instance together: HTTP/WebSocket listener and the
//!   fan-out subscription loop.
//! - [`client`] is a terminal client for the same protocol.
//!
//! The wire format is JSON `{ "kind": ..., "body": ... }` envelopes, see
//! [`message`].

pub mod cli;
pub mod client;
pub mod config;
mod connection;
pub mod error;
pub mod message;
pub mod registry;
pub mod room;
pub mod router;
pub mod server;
pub mod store;
