pub mod bridge;
pub mod handler;
pub mod resolve;
