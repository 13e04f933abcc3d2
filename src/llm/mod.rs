pub mod beam;
pub mod inference;
pub mod models;
