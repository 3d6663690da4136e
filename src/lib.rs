pub mod config;
pub mod errors;
pub mod finalize;
pub mod issue;
pub mod logging;
pub mod store;
pub mod tracker;
pub mod trigger;
pub mod util;
pub mod worker;
pub mod workflow;
