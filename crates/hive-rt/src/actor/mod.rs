//! The local process kernel and everything that runs on top of it:
//! behaviors, mailboxes, registries, supervision, call accounting, and the
//! observer service.

pub mod behavior;
pub mod calls;
pub mod child_spec;
pub mod kernel;
pub mod mailbox;
pub mod observer;
pub mod process;
pub mod registry;
pub mod supervisor;
