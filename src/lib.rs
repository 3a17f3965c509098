pub mod buffers;
pub mod config;
pub mod connection;
pub mod proto;
