//! gwplay - An interactive playground for an API gateway
//!
//! This library provides a small web front that:
//! - Relaunches a supervised gateway process with a submitted config pair
//! - Captures the gateway's merged stdout/stderr per generation
//! - Reverse-proxies traffic under a path prefix to the gateway's local port
//! - Stores config pairs under short content-derived names for sharing

pub mod config;
pub mod error;
pub mod front;
pub mod output;
pub mod page;
pub mod pair;
pub mod pool;
pub mod proxy;
pub mod route;
pub mod share;
pub mod supervisor;
