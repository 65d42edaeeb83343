//! Connection-oriented façade: [`Client`] for one peer, [`Server`] for
//! accepting many.

pub mod client;
pub mod server;

pub use client::{ChannelListener, Client, ClientEvent, ClientId, CommunicationListener};
pub use server::Server;
