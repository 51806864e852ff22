//! The per-session tracing request and the diagnostics reported back for it.
//!
//! Requests are loaded from JSON, e.g.
//!
//! ```json
//! {
//!   "ftrace_events": ["sched/sched_switch", "power/*"],
//!   "atrace_categories": ["gfx"],
//!   "buffer_size_kb": 4096,
//!   "kprobe_events": [{"probe": "do_sys_open", "type": "both"}]
//! }
//! ```

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FtraceConfig {
    // Entries are "name", "group/name" or "group/*".
    pub ftrace_events: Vec<String>,
    pub atrace_categories: Vec<String>,
    pub atrace_apps: Vec<String>,
    // Categories that should be recorded through the SDK rather than atrace.
    pub atrace_categories_prefer_sdk: Vec<String>,
    // Restricts raw_syscalls to these syscalls, e.g. "sys_read".
    pub syscall_events: Vec<String>,
    pub enable_function_graph: bool,
    pub function_filters: Vec<String>,
    pub function_graph_roots: Vec<String>,
    pub throttle_rss_stat: bool,
    pub buffer_size_kb: u32,
    // Treat buffer_size_kb as a minimum, the default wins if it is larger.
    pub buffer_size_lower_bound: bool,
    pub drain_buffer_percent: u32,
    pub use_monotonic_raw_clock: bool,
    pub preserve_ftrace_buffer: bool,
    pub disable_generic_events: bool,
    pub symbolize_ksyms: bool,
    pub compact_sched: Option<CompactSchedRequest>,
    pub print_filter: Option<PrintFilter>,
    pub kprobe_events: Vec<KprobeRequest>,
}

impl FtraceConfig {
    pub fn from_json(buf: &str) -> Result<Self> {
        let config: FtraceConfig = serde_json::from_str(buf)?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let buf = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json(&buf).with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn requires_atrace(&self) -> bool {
        !self.atrace_categories.is_empty() || !self.atrace_apps.is_empty()
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CompactSchedRequest {
    pub enabled: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PrintFilter {
    pub rules: Vec<PrintFilterRule>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct PrintFilterRule {
    pub prefix: Option<String>,
    pub atrace_msg: Option<AtraceMessageMatch>,
    pub allow: bool,
}

/// Matches atrace-formatted print events: `<type>|<pid>|<message>`.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AtraceMessageMatch {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub prefix: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KprobeKind {
    #[default]
    Kprobe,
    Kretprobe,
    Both,
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct KprobeRequest {
    pub probe: String,
    #[serde(rename = "type", default)]
    pub kind: KprobeKind,
}

/// Per-event problems hit while setting up a session. None of these fail the
/// session on their own.
#[derive(Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct FtraceSetupErrors {
    pub unknown_ftrace_events: Vec<String>,
    pub failed_ftrace_events: Vec<String>,
    pub atrace_errors: String,
}

impl FtraceSetupErrors {
    pub fn is_empty(&self) -> bool {
        self.unknown_ftrace_events.is_empty()
            && self.failed_ftrace_events.is_empty()
            && self.atrace_errors.is_empty()
    }
}
