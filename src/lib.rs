//! A low-level event scheduling kernel. The core of the library is the
//! [`Registry`], a thread-shared collection of prioritised work [sources]
//! — timers, idle work, I/O readiness watches, anything implementing the
//! [`Source`] trait — driven through a prepare/poll/check/dispatch cycle
//! by [`Registry::iteration`] or, wholesale, by [`MainLoop::run`].
//!
//! [sources]: Source
//!
//! # Usage
//!
//! Using the library starts by [registering] one or more sources with a
//! [`Priority`] each. A source that waits on a file descriptor also
//! contributes a [`Watch`] to the registry's poll table. Driving the
//! registry then repeatedly asks every source whether it is ready, blocks
//! on all contributed descriptors at most as long as the most impatient
//! source allows, and invokes the callbacks of the ready sources at the
//! most urgent ready priority — each of which decides for itself whether
//! it stays registered.
//!
//! Registration is thread-safe: a thread blocked waiting for events is
//! woken whenever another thread registers work, so new sources never
//! starve behind a stale wait.
//!
//! [registering]: Registry::register
//!
//! # Examples
//!
//! A timer dispatched three times, then quitting the loop.
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::time::Duration;
//!
//! use kairos::{MainLoop, Registry};
//!
//! # fn main() -> std::io::Result<()> {
//! let registry = Arc::new(Registry::new()?);
//! let main_loop = MainLoop::new(registry.clone());
//!
//! let ticks = Arc::new(AtomicUsize::new(0));
//! let counter = ticks.clone();
//! let handle = main_loop.clone();
//! let _id = registry.add_timeout(Duration::from_millis(1), move || {
//!     if counter.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
//!         handle.quit();
//!         false // Done, deregister the timer.
//!     } else {
//!         true // Re-arm.
//!     }
//! });
//!
//! main_loop.run();
//! assert_eq!(ticks.load(Ordering::SeqCst), 3);
//! # Ok(())
//! # }
//! ```

#![warn(anonymous_parameters,
        bare_trait_objects,
        missing_debug_implementations,
        missing_docs,
        trivial_casts,
        trivial_numeric_casts,
        unused_extern_crates,
        unused_import_braces,
        unused_qualifications,
        unused_results,
        variant_size_differences,
)]

// Disallow warnings when running tests.
#![cfg_attr(test, deny(warnings))]

// Disallow warnings in examples, we want to set a good example after all.
#![doc(test(attr(deny(warnings))))]

mod fd;
mod idle;
mod registry;
mod timer;

pub mod hook;
pub mod poll;
pub mod source;
pub mod sys;

#[cfg(unix)]
pub mod unix {
    //! Unix only extensions.

    pub use crate::sys::pipe::{new_pipe, Receiver, Sender};
}

pub use crate::fd::FdSource;
pub use crate::idle::Idle;
pub use crate::registry::{MainLoop, Registry};
pub use crate::timer::Timer;

#[doc(no_inline)]
pub use crate::hook::HookId;
#[doc(no_inline)]
pub use crate::poll::{Interests, PollEntry, PollFunc, Ready, Watch};
#[doc(no_inline)]
pub use crate::source::{Prepare, Priority, Source};
