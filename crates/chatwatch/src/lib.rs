//! chatwatch: watches a messaging account, keeps a bounded recent history
//! and fans surfaced events out to local display clients over a unix socket.

pub mod attention;
pub mod broadcast;
pub mod classifier;
pub mod client;
pub mod command;
pub mod config;
pub mod listener;
pub mod session;
pub mod store;
