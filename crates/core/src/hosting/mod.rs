//! Branch hosting: locations, formats, transports and the safe opener.

pub mod branch;
pub mod format;
pub mod opener;
pub mod transport;
pub mod urlutils;

pub use branch::{Branch, ReadLocks};
pub use format::{BranchFormat, ControlKind, FormatProber, ProberRegistry};
pub use opener::{OpenObserver, OpenOptions, RecordingObserver, SafeBranchOpener};
pub use transport::{LocalTransport, MemoryTransport, Transport};
