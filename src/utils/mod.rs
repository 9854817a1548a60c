pub mod audit_logger;
pub mod diagnostics;
pub mod line_ending_handler;
pub mod path_utils;
pub mod preferences;
pub mod session_registry;
