//! poolgrid-leak — catches callers that forget to release handles.
//!
//! The pool cannot see who holds a handle or for how long, so callers
//! register each checkout here. Anything held past the configured
//! threshold is reported as a probable leak:
//!
//! ```text
//! track_acquisition ──► Acquired ──activity──► Active
//!                          │                     │
//!                          └──── failure ──► Error ◄┘
//!                                   │
//! track_release / cleanup_leaks ────┴──► record dropped
//! ```
//!
//! Detection is time based only. A periodic sweep logs each leak once
//! and, with `auto_cleanup`, force-releases it through the release hook.

pub mod config;
pub mod detector;

pub use config::LeakConfig;
pub use detector::{
    AcquisitionRecord, CleanupSummary, LeakDetector, LeakHealth, LeakReport, LeakStats,
    LeakVerdict, RecordState, ReleaseHook,
};
