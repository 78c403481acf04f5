//! gemmtune session facade: tuning cases, runs and reports.

pub mod case;
#[cfg(feature = "cli")]
pub mod cli;
pub mod report;
pub mod session;

pub use case::*;
#[cfg(feature = "cli")]
pub use cli::*;
pub use report::*;
pub use session::*;
