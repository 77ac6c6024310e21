//! Kernel synchronization primitives

pub mod mutex;

pub use mutex::KMutex;
