// Config-driven resource handlers

mod field_map;
mod handler;

pub use field_map::FieldMap;
pub use handler::{Resource, ResourceHandler, ResourceHandlerModule};
