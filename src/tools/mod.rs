pub mod job_tool;
pub mod process_tool;
pub mod serial_tool;
pub mod session_manager;
pub mod sink;
pub mod toolchain_tool;
