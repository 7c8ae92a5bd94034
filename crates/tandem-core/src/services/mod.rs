//! Services shared by every client surface

mod store;

pub use store::{LocalChange, LocalChangeKind, LocalStore};
