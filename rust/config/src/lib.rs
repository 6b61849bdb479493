//! Configuration types shared between GPU tester crates.

mod run;
mod types;

pub use run::*;
pub use types::*;
