//! Integration tests for the media-server upload protocol

pub mod test_consumer_upload;
pub mod test_framing;
pub mod test_ring_wrap;
