//! # Core Infrastructure Module
//!
//! Building blocks shared by producers and consumers: the byte buffer between
//! their threads, transport-stream boundary scanning for clean switch points,
//! and the RTP port allocator.

pub mod port_pool;
pub mod stream_buffer;
pub mod ts;
