pub mod byte_store;
pub mod container_manager;
pub mod container_store;
pub mod dispatcher;
pub mod mesh;
pub mod metadata_store;
pub mod object_handler;
pub mod outbound;
pub mod resync;
pub mod retry_queue;
pub mod topology;
