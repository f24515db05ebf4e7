mod memory_test;
mod runtime_test;
mod state_test;
pub mod utils;
