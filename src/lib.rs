pub mod addr;
pub mod config;
pub mod hier;
pub mod timeq;
pub mod traffic;
