pub mod daemon;
pub mod ops;
pub mod storage;
pub mod sync;
