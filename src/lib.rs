pub mod api;
pub mod clock;
pub mod config;
pub mod error;
pub mod node;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod telemetry;
pub mod worker;
