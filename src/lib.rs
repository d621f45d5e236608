pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod frame;
pub mod host;
pub mod interceptor;
pub mod logging;
pub mod observer;
pub mod protocol;
pub mod storage;
pub mod store;
pub mod tungstenite;
