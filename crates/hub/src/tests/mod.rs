mod support;

mod codec;
mod config;
mod connection;
mod session;
mod stores;
