//! Communication building blocks.

pub mod communicator;
pub mod peer;
pub mod reduction;
pub mod stage;
pub mod wire;

pub use communicator::{CascadeCommTags, CommTag, Communicator, TagPair, Wait};
pub use stage::{AsyncCommStage, MemberId};
