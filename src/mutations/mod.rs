//! Mutation coordination.
//!
//! Create/delete comment, create post (with optional image upload) and
//! ticket acknowledgment. Every failure is returned to the caller.

mod coordinator;
mod retry;

pub use coordinator::{ImageUpload, MutationCoordinator, NewPost};
pub use retry::RetryPolicy;
