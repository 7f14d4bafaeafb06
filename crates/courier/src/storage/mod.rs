pub mod memory;

#[cfg(feature = "sql")]
pub mod postgres;

#[cfg(feature = "sql")]
pub mod postgres_schema;

#[cfg(feature = "etcd")]
pub mod etcd;
