//! # topolink-cluster: Announcements & Registry
//!
//! The data model exchanged between connectors and the store of what this
//! instance has heard.
//!
//! ## Announcement Tree
//! An [`Announcement`] carries its owner's cluster view plus the
//! announcements the owner relays for third instances (`inherited`). The
//! tree is bounded in depth and size at every boundary.
//!
//! ## Registry
//! [`AnnouncementRegistry`] keys entries by owner, expires them against the
//! local clock, and refuses owners already visible through another entry.
//! That refusal is how a cycle in the connector graph surfaces as a loop
//! instead of an ever-growing tree.

pub mod announcement;
pub mod monitor;
pub mod registry;

pub use announcement::Announcement;
pub use monitor::PingMonitor;
pub use registry::{AnnouncementRegistry, CachedAnnouncement, RegistrationOutcome};
