//! In-memory stand-ins for tracefs and atrace.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use ftrace_mux::compact_sched::CompactSchedFormat;
use ftrace_mux::event::{Event, Field, GroupAndName};
use ftrace_mux::tracefs::FtraceBackend;
use ftrace_mux::{AtraceWrapper, SyscallTable, TranslationTable};

pub type FakeTable = TranslationTable<HashMap<GroupAndName, String>>;

/// Records every file write the muxer would have made, keyed by the path
/// relative to the tracefs root, and keeps the resulting state around for
/// assertions.
#[derive(Debug)]
pub struct FakeBackend {
    root: PathBuf,
    pub writes: Vec<(String, String)>,
    pub failing_paths: BTreeSet<String>,

    pub tracing_on: bool,
    pub current_tracer: String,
    pub clock: String,
    pub clocks: BTreeSet<String>,
    pub group_events: BTreeMap<String, BTreeSet<String>>,
    pub enabled_events: BTreeSet<GroupAndName>,
    pub kprobes: BTreeSet<GroupAndName>,
    pub syscall_filter: Option<BTreeSet<usize>>,
    pub buffer_size_pages: Option<usize>,
    pub buffer_percent: Option<u32>,
    pub function_filters: Vec<String>,
    pub function_graph_filters: Vec<String>,
    pub rss_stat_throttled: bool,
}

impl Default for FakeBackend {
    fn default() -> Self {
        FakeBackend {
            root: PathBuf::from("/fake/tracing"),
            writes: Vec::new(),
            failing_paths: BTreeSet::new(),
            tracing_on: false,
            current_tracer: "nop".to_string(),
            clock: "boot".to_string(),
            clocks: ["boot", "global", "local"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            group_events: BTreeMap::new(),
            enabled_events: BTreeSet::new(),
            kprobes: BTreeSet::new(),
            syscall_filter: None,
            buffer_size_pages: None,
            buffer_percent: None,
            function_filters: Vec::new(),
            function_graph_filters: Vec::new(),
            rss_stat_throttled: false,
        }
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later write to `path` fail.
    pub fn fail_writes_to(&mut self, path: &str) {
        self.failing_paths.insert(path.to_string());
    }

    pub fn wrote(&self, path: &str, value: &str) -> bool {
        self.writes.iter().any(|(p, v)| p == path && v == value)
    }

    pub fn writes_to(&self, path: &str) -> Vec<&str> {
        self.writes
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn is_enabled(&self, group: &str, name: &str) -> bool {
        self.enabled_events.contains(&GroupAndName::new(group, name))
    }

    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }

    fn write(&mut self, path: &str, value: &str) -> Result<()> {
        if self.failing_paths.contains(path) {
            bail!("Failed to write '{}' to {}", value, path);
        }
        self.writes.push((path.to_string(), value.to_string()));
        Ok(())
    }
}

impl FtraceBackend for FakeBackend {
    fn root_path(&self) -> &Path {
        &self.root
    }

    fn is_tracing_available(&self) -> bool {
        self.current_tracer == "nop"
    }

    fn get_tracing_on(&self) -> bool {
        self.tracing_on
    }

    fn set_tracing_on(&mut self, on: bool) -> Result<()> {
        self.write("tracing_on", if on { "1" } else { "0" })?;
        self.tracing_on = on;
        Ok(())
    }

    fn enable_event(&mut self, group: &str, name: &str) -> Result<()> {
        self.write(&format!("events/{}/{}/enable", group, name), "1")?;
        self.enabled_events.insert(GroupAndName::new(group, name));
        Ok(())
    }

    fn disable_event(&mut self, group: &str, name: &str) -> Result<()> {
        self.write(&format!("events/{}/{}/enable", group, name), "0")?;
        self.enabled_events.remove(&GroupAndName::new(group, name));
        Ok(())
    }

    fn disable_all_events(&mut self) -> Result<()> {
        self.write("events/enable", "0")?;
        self.enabled_events.clear();
        Ok(())
    }

    fn get_event_names_for_group(&self, path: &str) -> BTreeSet<String> {
        self.group_events.get(path).cloned().unwrap_or_default()
    }

    fn clear_trace(&mut self) -> Result<()> {
        self.write("trace", "")
    }

    fn get_clock(&self) -> String {
        self.clock.clone()
    }

    fn available_clocks(&self) -> BTreeSet<String> {
        self.clocks.clone()
    }

    fn set_clock(&mut self, clock: &str) -> Result<()> {
        self.write("trace_clock", clock)?;
        self.clock = clock.to_string();
        Ok(())
    }

    fn set_cpu_buffer_size_in_pages(&mut self, pages: usize) -> Result<()> {
        self.write("buffer_size_pages", &pages.to_string())?;
        self.buffer_size_pages = Some(pages);
        Ok(())
    }

    fn set_buffer_percent(&mut self, percent: u32) -> Result<()> {
        self.write("buffer_percent", &percent.to_string())?;
        self.buffer_percent = Some(percent);
        Ok(())
    }

    fn set_current_tracer(&mut self, tracer: &str) -> Result<()> {
        self.write("current_tracer", tracer)?;
        self.current_tracer = tracer.to_string();
        Ok(())
    }

    fn reset_current_tracer(&mut self) -> Result<()> {
        self.set_current_tracer("nop")
    }

    fn append_function_filters(&mut self, filters: &[String]) -> Result<()> {
        for filter in filters {
            self.write("set_ftrace_filter", filter)?;
            self.function_filters.push(filter.clone());
        }
        Ok(())
    }

    fn append_function_graph_filters(&mut self, filters: &[String]) -> Result<()> {
        for filter in filters {
            self.write("set_graph_function", filter)?;
            self.function_graph_filters.push(filter.clone());
        }
        Ok(())
    }

    fn clear_function_filters(&mut self) -> Result<()> {
        self.write("set_ftrace_filter", "")?;
        self.function_filters.clear();
        Ok(())
    }

    fn clear_function_graph_filters(&mut self) -> Result<()> {
        self.write("set_graph_function", "")?;
        self.function_graph_filters.clear();
        Ok(())
    }

    fn create_kprobe_event(&mut self, group: &str, name: &str, is_retprobe: bool) -> Result<()> {
        let kind = if is_retprobe { "r" } else { "p" };
        self.write("kprobe_events", &format!("{}:{}/{} {}", kind, group, name, name))?;
        self.kprobes.insert(GroupAndName::new(group, name));
        Ok(())
    }

    fn remove_kprobe_event(&mut self, group: &str, name: &str) -> Result<()> {
        self.write("kprobe_events", &format!("-:{}/{}", group, name))?;
        self.kprobes.remove(&GroupAndName::new(group, name));
        Ok(())
    }

    fn set_syscall_filter(&mut self, ids: &BTreeSet<usize>) -> Result<()> {
        let value = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.write("events/raw_syscalls/filter", &value)?;
        self.syscall_filter = Some(ids.clone());
        Ok(())
    }

    fn supports_rss_stat_throttled(&self) -> bool {
        self.rss_stat_throttled
    }
}

/// Records atrace invocations instead of running anything.
#[derive(Debug)]
pub struct FakeAtrace {
    pub calls: Vec<Vec<String>>,
    pub userspace_only: bool,
    pub prefer_sdk: bool,
    pub succeed: bool,
    pub stderr: String,
}

impl Default for FakeAtrace {
    fn default() -> Self {
        FakeAtrace {
            calls: Vec::new(),
            userspace_only: true,
            prefer_sdk: false,
            succeed: true,
            stderr: String::new(),
        }
    }
}

impl FakeAtrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_call(&self) -> Option<Vec<&str>> {
        self.calls
            .last()
            .map(|call| call.iter().map(|s| s.as_str()).collect())
    }
}

impl AtraceWrapper for FakeAtrace {
    fn run_atrace(&mut self, args: &[String], errors: Option<&mut String>) -> bool {
        self.calls.push(args.to_vec());
        if let Some(errors) = errors {
            errors.push_str(&self.stderr);
        }
        self.succeed
    }

    fn supports_userspace_only(&self) -> bool {
        self.userspace_only
    }

    fn supports_prefer_sdk(&self) -> bool {
        self.prefer_sdk
    }
}

pub fn args(call: &[&str]) -> Vec<String> {
    call.iter().map(|s| s.to_string()).collect()
}

fn event(group: &str, name: &str, id: usize, fields: &[&str]) -> Event {
    let mut event = Event::new(group, name, id);
    event.fields = fields
        .iter()
        .map(|field| Field {
            name: field.to_string(),
            ..Default::default()
        })
        .collect();
    event
}

/// Format file contents for an event the table can materialize on demand.
pub fn format_file(name: &str, id: usize) -> String {
    format!(
        "name: {}\nID: {}\nformat:\n\
         \tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;\n",
        name, id
    )
}

pub const SCHED_SWITCH_ID: usize = 1;
pub const SCHED_WAKING_ID: usize = 2;
pub const SCHED_WAKEUP_ID: usize = 10;
pub const SCHED_NEW_ID: usize = 11;
pub const CGROUP_MKDIR_ID: usize = 12;
pub const VMSCAN_ID: usize = 13;
pub const LOWMEMORY_KILL_ID: usize = 14;
pub const PRINT_ID: usize = 20;
pub const SYS_ENTER_ID: usize = 329;
pub const SYS_EXIT_ID: usize = 330;
pub const FUNCGRAPH_ENTRY_ID: usize = 40;
pub const FUNCGRAPH_EXIT_ID: usize = 41;
pub const RSS_STAT_ID: usize = 50;
pub const RSS_STAT_THROTTLED_ID: usize = 51;

/// Table holding the events the scenarios use. Events not listed here can
/// still be materialized from `formats`.
pub fn table_with_formats(formats: &[(&str, &str, usize)]) -> FakeTable {
    let events = vec![
        event(
            "sched",
            "sched_switch",
            SCHED_SWITCH_ID,
            &["prev_state", "next_pid", "next_prio", "next_comm"],
        ),
        event(
            "sched",
            "sched_waking",
            SCHED_WAKING_ID,
            &["pid", "target_cpu", "prio", "comm"],
        ),
        event("sched", "sched_wakeup", SCHED_WAKEUP_ID, &[]),
        event("sched", "sched_new", SCHED_NEW_ID, &[]),
        event("cgroup", "cgroup_mkdir", CGROUP_MKDIR_ID, &[]),
        event("vmscan", "mm_vmscan_direct_reclaim_begin", VMSCAN_ID, &[]),
        event("lowmemorykiller", "lowmemory_kill", LOWMEMORY_KILL_ID, &[]),
        event("ftrace", "print", PRINT_ID, &["buf"]),
        event("ftrace", "funcgraph_entry", FUNCGRAPH_ENTRY_ID, &[]),
        event("ftrace", "funcgraph_exit", FUNCGRAPH_EXIT_ID, &[]),
        event("raw_syscalls", "sys_enter", SYS_ENTER_ID, &[]),
        event("raw_syscalls", "sys_exit", SYS_EXIT_ID, &[]),
        event("kmem", "rss_stat", RSS_STAT_ID, &[]),
        event("synthetic", "rss_stat_throttled", RSS_STAT_THROTTLED_ID, &[]),
    ];

    let compact_sched_format = CompactSchedFormat::validate(
        events.iter().find(|e| e.name == "sched_switch"),
        events.iter().find(|e| e.name == "sched_waking"),
    );

    let reader = formats
        .iter()
        .map(|(group, name, id)| (GroupAndName::new(*group, *name), format_file(name, *id)))
        .collect();
    TranslationTable::new(reader, events, compact_sched_format)
}

pub fn table() -> FakeTable {
    table_with_formats(&[])
}

pub fn syscalls() -> SyscallTable {
    SyscallTable::from_names(&[
        "sys_restart_syscall",
        "sys_exit",
        "sys_fork",
        "sys_read",
        "sys_write",
        "sys_open",
        "sys_close",
    ])
}
