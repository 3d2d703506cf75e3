pub mod block_out;
pub mod parser;
pub mod poll_in;
pub mod poll_out;
pub mod recycle;
