use super::*;

// Import snafu for derive macro
use snafu::Snafu;

mod endpoint;
mod error;
mod message;
mod notify;
mod session;
mod subscribe;

pub use {
    endpoint::{Endpoint, Socks5, StratumUrl},
    error::{JsonRpcError, SessionError},
    message::{Id, Message},
    notify::Notify,
    subscribe::SubscribeResult,
};

pub(crate) use session::{SessionConfig, watch_endpoint};
