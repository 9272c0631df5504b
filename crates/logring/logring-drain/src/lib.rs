mod drain;

pub use drain::{Drain, Format};
