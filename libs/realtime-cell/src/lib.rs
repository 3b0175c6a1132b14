pub mod models;
pub mod error;
pub mod rows;
pub mod services;
pub mod handlers;
pub mod router;

pub use models::*;
pub use error::*;
pub use rows::*;
pub use services::*;
pub use router::realtime_routes;
