pub mod server;
pub mod telemetry;

pub use server::{create_router, AppState};
