pub mod header;
pub mod types;
pub mod wire;
