pub mod gateway;
pub mod models;
pub mod schema;

pub use gateway::StorageGateway;
