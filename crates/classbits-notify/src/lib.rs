//! Who hears about a siphon transition, and live delivery of what they hear.

pub mod dispatcher;
pub mod fanout;

pub use dispatcher::Dispatcher;
pub use fanout::{SiphonContext, Transition, plan};
