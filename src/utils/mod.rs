mod history;
mod queue;
mod seq;

pub use history::*;
pub use queue::*;
pub use seq::*;
