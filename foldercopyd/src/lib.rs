pub mod copy;
pub mod daemon;
pub mod job;
pub mod storage;
