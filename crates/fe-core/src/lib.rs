// Session binding and action dispatch for the web file manager

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod protocol;
pub mod session;
