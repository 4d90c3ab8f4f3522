pub mod auth;
pub mod error;
pub mod middleware;
pub mod notifications;
pub mod routes;
pub mod sanitize;
pub mod siphon;
pub mod storage;
pub mod tally;
pub mod workflow;

pub use routes::router;
