pub mod cli;
pub mod daemon;
pub mod discover;

pub use cli::*;
pub use daemon::*;
pub use discover::*;
