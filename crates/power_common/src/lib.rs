//! Power Common - shared vocabulary for the power settings daemon
//!
//! Layout of the boot surface, durable markers, process probing, command
//! execution, voltage decoding and the status snapshot type.

pub mod command_exec;
pub mod error;
pub mod markers;
pub mod operation;
pub mod paths;
pub mod process_probe;
pub mod status;
pub mod voltage;

pub use command_exec::{
    CommandOutput, CommandRunner, FakeCommandRunner, HostCommandRunner, SystemCommand,
};
pub use error::{BusyReason, PowerError, Result};
pub use markers::{Marker, MarkerStore, Staged};
pub use operation::{Operation, Outcome};
pub use paths::Layout;
pub use process_probe::{FakeProcessTable, ProcessProbe, ProcessTable, SysinfoProcessTable};
pub use status::{BackupRecord, DiskUsage, SystemStatus};
pub use voltage::VoltageState;
