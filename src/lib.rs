pub mod cli;
pub mod pipeline;
pub mod storage;
pub mod utils;
