pub mod health_handlers;
pub mod mesh_handlers;
