mod clock;
mod emitter;

pub use clock::{current_caller, now_ns};
pub use emitter::{EmitError, Emitted, Emitter, LogLevel};
