//! Command handlers, one module per top-level subcommand.

pub mod config_cmd;
pub mod detect;
pub mod profiles;
pub mod util;
