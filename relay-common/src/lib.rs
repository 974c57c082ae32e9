pub mod message;
pub mod metrics;
pub mod mock;
pub mod redis;
