pub mod backup;
pub mod config;
pub mod deps;
pub mod error;
pub mod io;
pub mod manifest;
pub mod merge;
pub mod migrations;
pub mod paths;
pub mod process;
pub mod registry;
pub mod resolver;
pub mod source;
pub mod upgrade;
pub mod version;

#[cfg(test)]
mod test_support;

pub use error::{PlankitError, Result};
