pub mod args;
pub mod op;
pub mod ops;

pub use ops::{Del, Get, Ls, Put, Tree, Version, Watch};
