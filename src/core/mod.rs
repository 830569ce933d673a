pub mod bridge;
pub mod bus;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod errors;
pub mod job;
pub mod lifecycle;
pub mod protocol;
pub mod queue;
pub mod robot;
pub mod storage;
pub mod terminal;
pub mod triggers;
