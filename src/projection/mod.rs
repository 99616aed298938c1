//! Budget-window projection of a base snapshot into calibrated year snapshots

mod cancel;
mod config;
mod engine;
mod window;

pub use cancel::CancellationToken;
pub use config::{default_concurrency, BudgetWindow, ProjectionConfig};
pub use engine::BudgetWindowProjector;
pub use window::{WindowOutcome, WindowProjection, WindowReport, WindowStatus};
