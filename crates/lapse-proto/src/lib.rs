pub mod abort;
pub mod frame;

pub use abort::AbortFlag;
pub use frame::{Angles, Frame};
