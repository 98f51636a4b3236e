pub mod events;
pub mod models;
pub mod outcome;
pub mod requests;
pub mod retry;
pub mod tasks;

pub use tasks::{TaskKind, VisionOp};
