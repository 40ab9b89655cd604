//! Integration tests for producer and consumer thread coordination

pub mod test_producer_lifecycle;
