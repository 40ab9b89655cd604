//! Integration tests for RTSP tuner control

pub mod test_retry;
