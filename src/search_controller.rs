mod main;
mod search;

pub use main::*;
