pub mod memory;
pub mod redis_store;
pub mod types;

pub use memory::MemoryStateStore;
pub use redis_store::RedisStateStore;
pub use types::StateStore;
