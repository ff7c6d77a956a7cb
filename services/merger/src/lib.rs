//! The merger daemon: ordered layers of DMX channel values folded into a
//! single universe, driven by framed JSON requests on a local socket.

pub mod config;
pub mod dispatch;
pub mod layer;
pub mod merge;
pub mod service;
