pub mod config;
pub mod error;
pub mod node;
pub mod pool;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;
