//! CLI commands, one per file

mod start;
mod status;
mod stop;
mod worker;

pub use start::start;
pub use status::status;
pub use stop::stop;
pub use worker::worker;
