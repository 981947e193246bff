pub mod memory_cluster;
pub mod memory_stream;

#[cfg(feature = "kafka")]
pub mod kafka_stream;

#[cfg(feature = "etcd")]
pub mod etcd_topology;
