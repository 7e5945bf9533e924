//! Concrete blocks.
//!
//! - [`sequence`]: children one after the other (`actions`)
//! - [`repeat`]: a child a number of times (`repeat`)
//! - [`timer`]: pausable wait leaf (`wait`)
//! - [`shorthand`]: call of a named definition
//! - [`state`]: device state publisher (`devices`)

pub mod repeat;
pub mod sequence;
pub mod shorthand;
pub mod state;
pub mod timer;

pub use repeat::RepeatBlock;
pub use sequence::SequenceBlock;
pub use shorthand::ShorthandBlock;
pub use state::StatePublisherBlock;
pub use timer::TimerBlock;
