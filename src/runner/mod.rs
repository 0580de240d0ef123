pub mod coverage;
pub mod monitor;
pub mod process;
pub mod worker;
