//! Integration tests for capture device locking and recording

pub mod test_lock_race;
pub mod test_recording_switch;
