//! Long-lived task wiring: supervisor, tail-follow, WSS listener.

pub mod supervisor;
pub mod wss;

pub use supervisor::{TailFollow, run_supervised};
pub use wss::WssListener;
