mod apply;
mod store;

pub use store::{APPLY_ENQUEUE_WAIT, StateStore};
