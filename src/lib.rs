//! postline - content distribution feedback loop
//!
//! Takes creator content in batches and:
//! - Plans a posting calendar over approved destinations (communities)
//! - Checks every request against the destination's rules before posting
//! - Publishes through a headless browser session per actor
//! - Watches published posts and backs off from destinations that remove them
//! - Learns which destinations, hours and styles perform best
//!
//! # Example
//!
//! ```ignore
//! use postline::config::Config;
//! use postline::pipeline::Pipeline;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pipeline = Pipeline::build(Config::load()?).await?;
//!     let report = pipeline.monitor().run_cycle().await?;
//!     println!("{} removed", report.removed);
//!     Ok(())
//! }
//! ```

// Core modules
pub mod types;
pub mod config;
pub mod store;
pub mod messaging;
pub mod cli;

// Pipeline components
pub mod rules;
pub mod compliance;
pub mod scheduler;
pub mod executor;
pub mod monitor;
pub mod risk;
pub mod learner;

// Integrations
pub mod browser;
pub mod llm;
pub mod platform;

// Runtime
pub mod jobs;
pub mod pipeline;

pub use config::Config;
pub use store::Store;
pub use types::ActorId;
