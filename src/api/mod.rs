pub mod handlers;
pub mod models;
pub mod predict;
pub mod server;

pub use server::create_router;
