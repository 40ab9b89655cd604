//! Integration tests combining multiple components
//!
//! These tests drive real producers, consumers and protocol clients against
//! loopback fakes of the tuner and the media server.

#[path = "../common/mod.rs"]
mod common;

mod capture;
mod rtsp;
mod session;
mod upload;
