pub mod db;
pub mod distributed_lock;
pub mod log_redact;
pub mod logging;
pub mod memory_chain;
pub mod rpc_gateway;
