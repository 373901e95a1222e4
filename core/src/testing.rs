pub mod testcase;

pub use testcase::*;
