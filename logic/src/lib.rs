#![forbid(unsafe_code)]

pub mod config;
pub mod consts;
mod dht;
mod id;
mod kbucket;
mod routing;
pub mod search;
pub mod transport;

pub use dht::Dht;
pub use id::{sort_by_distance, Id};
pub use routing::{InsertOutcome, RoutingTable};
