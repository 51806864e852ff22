//! ftrace-mux library - share one kernel ftrace configuration between many
//! independent tracing sessions.
//!
//! Each session hands the [`FtraceConfigMuxer`] a [`FtraceConfig`] describing
//! the events, atrace categories, syscall filters, kprobes and buffer setup it
//! wants. The muxer applies the union of all sessions to tracefs and, when a
//! session is removed, turns off only what no other session still needs.
//!
//! # Modules
//!
//! - [`muxer`] - the session lifecycle and state reconciliation
//! - [`tracefs`] - the [`FtraceBackend`] trait and the real tracefs backend
//! - [`event_table`] - name/id lookup of ftrace event descriptors
//! - [`atrace`] / [`atrace_categories`] - Android userspace tracing
//! - [`config`] - the JSON request format and setup diagnostics
//!
//! # Example
//!
//! ```no_run
//! use ftrace_mux::{
//!     AtraceCommand, FtraceConfig, FtraceConfigMuxer, SyscallTable, Tracefs, TranslationTable,
//! };
//!
//! let tracefs = Tracefs::discover()?;
//! let table = TranslationTable::create(tracefs.clone());
//! let mut muxer = FtraceConfigMuxer::new(
//!     tracefs,
//!     AtraceCommand::new(),
//!     table,
//!     SyscallTable::native(),
//!     Default::default(),
//!     false,
//! );
//!
//! let config = FtraceConfig::from_json(r#"{"ftrace_events": ["sched/sched_switch"]}"#)?;
//! muxer.setup_config(1, &config, None)?;
//! muxer.activate_config(1)?;
//! // ... read the trace ...
//! muxer.remove_config(1)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod atrace;
pub mod atrace_categories;
pub mod compact_sched;
pub mod config;
pub mod event;
pub mod event_filter;
pub mod event_table;
pub mod muxer;
pub mod print_filter;
pub mod syscall_table;
pub mod tracefs;
pub mod vendor_events;

// Re-export for convenience
pub use atrace::{AtraceCommand, AtraceWrapper};
pub use config::{FtraceConfig, FtraceSetupErrors};
pub use event::{Event, GroupAndName};
pub use event_filter::EventFilter;
pub use event_table::{EventTable, TranslationTable};
pub use muxer::{
    compute_cpu_buffer_size_in_pages, FtraceConfigId, FtraceConfigMuxer, FtraceDataSourceConfig,
    FtraceState, KprobeType,
};
pub use syscall_table::SyscallTable;
pub use tracefs::{FtraceBackend, Tracefs};
pub use vendor_events::VendorEvents;
