//! Service layer
//!
//! Board workflows separated from HTTP handlers. Services orchestrate the
//! store, the actor directory and the delivery queue.

mod board;

pub use board::{BoardService, FollowAction, NewPost};
