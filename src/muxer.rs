//! Multiplexes concurrent tracing sessions onto the single, global ftrace
//! configuration of the kernel.
//!
//! Every session asks for its own set of events, atrace categories, syscall
//! filters and so on. The kernel only has one of each toggle, so the muxer
//! applies the union of what all sessions want and keeps enough per-session
//! bookkeeping to back out exactly the part a session is responsible for when
//! it goes away. Reference counting is done by recomputing the union over
//! the surviving sessions and diffing it against what is currently applied,
//! rather than with per-item counters.
//!
//! A session moves through `setup_config` (configured), `activate_config`
//! (contributing to `tracing_on`) and `remove_config`. Buffer size, clock and
//! the initial cleanup of tracefs happen only when the first session is set
//! up and are undone once the last one is removed.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use anyhow::{bail, Context, Result};
use perfetto_protos::ftrace_event_bundle::FtraceClock;
use tracing::{debug, error, info, warn};

use crate::atrace::AtraceWrapper;
use crate::atrace_categories::add_atrace_category_events;
use crate::compact_sched::{create_compact_sched_config, CompactSchedConfig};
use crate::config::{FtraceConfig, FtraceSetupErrors, KprobeKind};
use crate::event::{split_group_and_name, Event, GroupAndName, KPROBE_GROUP, KRETPROBE_GROUP};
use crate::event_filter::EventFilter;
use crate::event_table::EventTable;
use crate::print_filter::FtracePrintFilterConfig;
use crate::syscall_table::{SyscallTable, MAX_SYSCALLS};
use crate::tracefs::{page_size, FtraceBackend};
use crate::vendor_events::VendorEvents;

pub type FtraceConfigId = u64;

/// Syscall filter marker meaning "every syscall", i.e. no restriction.
pub const ALL_SYSCALLS_ID: usize = MAX_SYSCALLS + 1;

// In order of preference. "boot" is what consumers expect on modern kernels.
const CLOCKS: &[&str] = &["boot", "global", "local"];
const CLOCK_MONO_RAW: &str = "mono_raw";

const DEFAULT_LOW_RAM_PER_CPU_BUFFER_SIZE_KB: u64 = 2 * 1024;
const DEFAULT_HIGH_RAM_PER_CPU_BUFFER_SIZE_KB: u64 = 8 * 1024;
// Devices with at least this much memory get the larger default buffer.
const HIGH_MEM_BYTES: u64 = 7 * 1024 * 1024 * 1024;

const DEFAULT_BUFFER_PERCENT: u32 = 50;

const SYSCALLS_RETURNING_FDS: &[&str] = &[
    "sys_open",
    "sys_openat",
    "sys_socket",
    "sys_dup",
    "sys_dup2",
    "sys_dup3",
];

/// Per-CPU ring buffer size for a request, in pages. Never less than one.
///
/// A request of 0 gets a default picked by how much memory the machine has.
/// With `lower_bound` set the request is only a minimum and the default wins
/// if it is bigger.
pub fn compute_cpu_buffer_size_in_pages(
    requested_buffer_size_kb: usize,
    buffer_size_lower_bound: bool,
    sysconf_phys_pages: i64,
) -> usize {
    let page_sz = page_size() as u64;
    let high_mem =
        sysconf_phys_pages > 0 && sysconf_phys_pages as u64 >= HIGH_MEM_BYTES / page_sz;
    let default_size_kb = if high_mem {
        DEFAULT_HIGH_RAM_PER_CPU_BUFFER_SIZE_KB
    } else {
        DEFAULT_LOW_RAM_PER_CPU_BUFFER_SIZE_KB
    };

    let mut actual_size_kb = requested_buffer_size_kb as u64;
    if requested_buffer_size_kb == 0
        || (buffer_size_lower_bound && default_size_kb > actual_size_kb)
    {
        actual_size_kb = default_size_kb;
    }

    let pages = actual_size_kb / (page_sz / 1024);
    pages.max(1) as usize
}

fn sysconf_phys_pages() -> i64 {
    unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) as i64 }
}

/// How a consumer should read a kprobe event. The discriminants are the
/// values used on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KprobeType {
    Begin = 1,
    End = 2,
    Instant = 3,
}

impl KprobeType {
    pub fn value(self) -> i32 {
        self as i32
    }
}

fn clock_from_name(clock: &str) -> FtraceClock {
    match clock {
        // Boot is the implied default, so it has no enum value of its own.
        "boot" => FtraceClock::FTRACE_CLOCK_UNSPECIFIED,
        "global" => FtraceClock::FTRACE_CLOCK_GLOBAL,
        "local" => FtraceClock::FTRACE_CLOCK_LOCAL,
        CLOCK_MONO_RAW => FtraceClock::FTRACE_CLOCK_MONO_RAW,
        _ => FtraceClock::FTRACE_CLOCK_UNKNOWN,
    }
}

fn validate_kprobe_name(name: &str) -> bool {
    name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn get_ftrace_kprobe_events(request: &FtraceConfig) -> BTreeMap<GroupAndName, KprobeType> {
    let mut events = BTreeMap::new();
    for kprobe in &request.kprobe_events {
        let probe = kprobe.probe.as_str();
        let entry = GroupAndName::new(KPROBE_GROUP, probe);
        let exit = GroupAndName::new(KRETPROBE_GROUP, probe);
        match kprobe.kind {
            KprobeKind::Kprobe => {
                events.insert(entry, KprobeType::Instant);
            }
            KprobeKind::Kretprobe => {
                events.insert(exit, KprobeType::Instant);
            }
            KprobeKind::Both => {
                events.insert(entry, KprobeType::Begin);
                events.insert(exit, KprobeType::End);
            }
            KprobeKind::Unknown => {
                debug!("Unknown kprobe type for {}", probe);
            }
        }
    }
    events
}

/// What the muxer believes the kernel's ftrace state currently is.
#[derive(Clone, Debug, PartialEq)]
pub struct FtraceState {
    // Union of every session's event filter.
    pub ftrace_events: EventFilter,
    // Syscall ids applied to raw_syscalls. Empty means unrestricted.
    pub syscall_filter: BTreeSet<usize>,
    pub funcgraph_on: bool,
    pub cpu_buffer_size_pages: usize,
    pub ftrace_clock: FtraceClock,
    pub atrace_on: bool,
    pub atrace_apps: BTreeSet<String>,
    pub atrace_categories: BTreeSet<String>,
    pub atrace_categories_prefer_sdk: BTreeSet<String>,
    // tracing_on as we found it, restored when the last session goes away.
    pub saved_tracing_on: bool,
    pub installed_kprobes: BTreeSet<GroupAndName>,
}

impl Default for FtraceState {
    fn default() -> Self {
        FtraceState {
            ftrace_events: EventFilter::new(),
            syscall_filter: BTreeSet::new(),
            funcgraph_on: false,
            cpu_buffer_size_pages: 0,
            ftrace_clock: FtraceClock::FTRACE_CLOCK_UNSPECIFIED,
            atrace_on: false,
            atrace_apps: BTreeSet::new(),
            atrace_categories: BTreeSet::new(),
            atrace_categories_prefer_sdk: BTreeSet::new(),
            saved_tracing_on: false,
            installed_kprobes: BTreeSet::new(),
        }
    }
}

/// Everything the muxer remembers about one session.
#[derive(Clone, Debug)]
pub struct FtraceDataSourceConfig {
    /// Events this session asked for and that ended up enabled.
    pub event_filter: EventFilter,
    pub syscall_filter: EventFilter,
    pub compact_sched: CompactSchedConfig,
    pub print_filter: Option<FtracePrintFilterConfig>,
    pub atrace_apps: BTreeSet<String>,
    pub atrace_categories: BTreeSet<String>,
    /// Categories not listed as prefer-SDK.
    pub atrace_categories_sdk_optout: BTreeSet<String>,
    pub symbolize_ksyms: bool,
    /// 0 if the session didn't ask for a specific value.
    pub buffer_percent: u32,
    pub syscalls_returning_fd: BTreeSet<i64>,
    /// Kprobe event id to how the probe's hits should be interpreted.
    pub kprobes: HashMap<usize, KprobeType>,
}

pub struct FtraceConfigMuxer<B: FtraceBackend, A: AtraceWrapper, T: EventTable> {
    ftrace: B,
    atrace: A,
    table: T,
    syscalls: SyscallTable,
    current_state: FtraceState,
    ds_configs: BTreeMap<FtraceConfigId, FtraceDataSourceConfig>,
    // Subset of ds_configs keys that keep tracing_on enabled.
    active_configs: BTreeSet<FtraceConfigId>,
    vendor_events: VendorEvents,
    // Secondary instances can't use atrace, it only drives the main buffer.
    secondary_instance: bool,
}

impl<B: FtraceBackend, A: AtraceWrapper, T: EventTable> FtraceConfigMuxer<B, A, T> {
    pub fn new(
        ftrace: B,
        atrace: A,
        table: T,
        syscalls: SyscallTable,
        vendor_events: VendorEvents,
        secondary_instance: bool,
    ) -> Self {
        FtraceConfigMuxer {
            ftrace,
            atrace,
            table,
            syscalls,
            current_state: FtraceState::default(),
            ds_configs: BTreeMap::new(),
            active_configs: BTreeSet::new(),
            vendor_events,
            secondary_instance,
        }
    }

    pub fn backend(&self) -> &B {
        &self.ftrace
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.ftrace
    }

    pub fn atrace(&self) -> &A {
        &self.atrace
    }

    pub fn table(&self) -> &T {
        &self.table
    }

    pub fn state(&self) -> &FtraceState {
        &self.current_state
    }

    pub fn central_event_filter(&self) -> &EventFilter {
        &self.current_state.ftrace_events
    }

    pub fn syscall_filter(&self) -> &BTreeSet<usize> {
        &self.current_state.syscall_filter
    }

    pub fn per_cpu_buffer_size_pages(&self) -> usize {
        self.current_state.cpu_buffer_size_pages
    }

    pub fn ftrace_clock(&self) -> FtraceClock {
        self.current_state.ftrace_clock
    }

    pub fn get_data_source_config(&self, id: FtraceConfigId) -> Option<&FtraceDataSourceConfig> {
        self.ds_configs.get(&id)
    }

    /// Resolves the full set of events a request needs. Doesn't touch any
    /// state.
    pub fn get_ftrace_events(&self, request: &FtraceConfig) -> BTreeSet<GroupAndName> {
        let mut events = BTreeSet::new();
        for config_value in &request.ftrace_events {
            let (group, name) = split_group_and_name(config_value);
            if name == "*" {
                for name in self.ftrace.get_event_names_for_group(&format!("events/{}", group)) {
                    events.insert(GroupAndName::new(group, name));
                }
            } else if group.is_empty() {
                // Without a group we can only find events the table knows.
                let Some(event) = self.table.get_event_by_name(name) else {
                    debug!(
                        "Event doesn't exist: {}. Include the group in the config to allow \
                         the event to be output as a generic event.",
                        name
                    );
                    continue;
                };
                events.insert(event.group_and_name());
            } else {
                events.insert(GroupAndName::new(group, name));
            }
        }

        if request.requires_atrace() {
            events.insert(GroupAndName::new("ftrace", "print"));
            let rss_stat_throttled = self.ftrace.supports_rss_stat_throttled();
            for category in &request.atrace_categories {
                let table: &dyn EventTable = &self.table;
                if !add_atrace_category_events(category, table, rss_stat_throttled, &mut events) {
                    debug!("Unknown atrace category {}", category);
                }
            }
        }

        if !request.syscall_events.is_empty() {
            events.insert(GroupAndName::new("raw_syscalls", "sys_enter"));
            events.insert(GroupAndName::new("raw_syscalls", "sys_exit"));
        }

        if request.enable_function_graph {
            events.insert(GroupAndName::new("ftrace", "funcgraph_entry"));
            events.insert(GroupAndName::new("ftrace", "funcgraph_exit"));
        }

        if request.throttle_rss_stat
            && self.ftrace.supports_rss_stat_throttled()
            && events.remove(&GroupAndName::new("kmem", "rss_stat"))
        {
            events.insert(GroupAndName::new("synthetic", "rss_stat_throttled"));
        }

        events
    }

    /// Applies `request` on top of whatever the other sessions have set up
    /// and records the session under `id`.
    ///
    /// Failing here leaves no session record behind, but backend changes made
    /// before the failure (e.g. enabled events) are not undone.
    pub fn setup_config(
        &mut self,
        id: FtraceConfigId,
        request: &FtraceConfig,
        mut errors: Option<&mut FtraceSetupErrors>,
    ) -> Result<()> {
        if id == 0 {
            bail!("Config id 0 is reserved");
        }
        if self.ds_configs.contains_key(&id) {
            bail!("Config {} already set up", id);
        }

        let mut filter = EventFilter::new();
        if self.ds_configs.is_empty() {
            debug_assert!(self.active_configs.is_empty());

            // We can't tell every way someone else may be using ftrace, a
            // non-nop tracer is the one we check for.
            if !request.preserve_ftrace_buffer && !self.ftrace.is_tracing_available() {
                error!(
                    "ftrace in use by someone else. Check that {} current_tracer is nop.",
                    self.ftrace.root_path().join("current_tracer").display()
                );
                bail!("ftrace is in use by another tracer");
            }

            self.current_state.saved_tracing_on = self.ftrace.get_tracing_on();
            if !request.preserve_ftrace_buffer {
                if let Err(e) = self.ftrace.set_tracing_on(false) {
                    warn!("Failed to turn off tracing: {:#}", e);
                }
                // Expected to fail where events/enable isn't writable, the
                // per-event enables are still balanced.
                match self.ftrace.disable_all_events() {
                    Ok(()) => self.current_state.ftrace_events.clear(),
                    Err(e) => debug!("Failed to disable all events: {:#}", e),
                }
                if let Err(e) = self.ftrace.clear_trace() {
                    warn!("Failed to clear trace: {:#}", e);
                }
                // Resizing truncates the buffer, so it's skipped when
                // preserving it.
                self.setup_clock(request);
                self.setup_buffer_size(request);
            }
        }

        let mut events = self.get_ftrace_events(request);
        let events_kprobes = get_ftrace_kprobe_events(request);

        for category in &request.atrace_categories {
            if let Some(vendor) = self.vendor_events.get(category) {
                events.extend(vendor.iter().cloned());
            }
        }

        if request.requires_atrace() {
            if self.secondary_instance {
                error!(
                    "Secondary ftrace instances do not support atrace_categories and \
                     atrace_apps options as they affect global state"
                );
                bail!("atrace is not supported on secondary instances");
            }
            if !self.atrace.supports_userspace_only() && !self.ds_configs.is_empty() {
                error!("Concurrent atrace sessions need atrace --only_userspace support");
                bail!("Concurrent atrace sessions are not supported");
            }
            self.update_atrace(request, errors.as_deref_mut().map(|e| &mut e.atrace_errors));
        }

        let mut kprobes = HashMap::new();
        for (group_and_name, kprobe_type) in events_kprobes {
            if !validate_kprobe_name(group_and_name.name()) {
                error!("Invalid kprobe name {}", group_and_name.name());
                if let Some(errors) = errors.as_deref_mut() {
                    errors.failed_ftrace_events.push(group_and_name.to_string());
                }
                continue;
            }

            // The event only shows up once the probe is written to
            // kprobe_events.
            if !self.current_state.installed_kprobes.contains(&group_and_name) {
                if let Err(e) = self.ftrace.create_kprobe_event(
                    group_and_name.group(),
                    group_and_name.name(),
                    group_and_name.group() == KRETPROBE_GROUP,
                ) {
                    error!("Failed to create kprobe {}: {:#}", group_and_name, e);
                    if let Some(errors) = errors.as_deref_mut() {
                        errors.failed_ftrace_events.push(group_and_name.to_string());
                    }
                    continue;
                }
            }

            let Some(event) = self.table.get_or_create_kprobe_event(&group_and_name).cloned() else {
                error!("Can't enable kprobe {}", group_and_name);
                if let Err(e) = self
                    .ftrace
                    .remove_kprobe_event(group_and_name.group(), group_and_name.name())
                {
                    warn!("Failed to remove kprobe {}: {:#}", group_and_name, e);
                }
                self.current_state.installed_kprobes.remove(&group_and_name);
                if let Some(errors) = errors.as_deref_mut() {
                    errors.unknown_ftrace_events.push(group_and_name.to_string());
                }
                continue;
            };
            self.current_state.installed_kprobes.insert(group_and_name.clone());
            self.enable_ftrace_event(&event, &mut filter, errors.as_deref_mut());
            kprobes.insert(event.ftrace_event_id, kprobe_type);
        }

        for group_and_name in &events {
            if group_and_name.is_kprobe_group() {
                debug!("Can't enable {}, group reserved for kprobes", group_and_name);
                if let Some(errors) = errors.as_deref_mut() {
                    errors.failed_ftrace_events.push(group_and_name.to_string());
                }
                continue;
            }

            let Some(event) = self.table.get_or_create_event(group_and_name).cloned() else {
                debug!("Can't enable {}, event not known", group_and_name);
                if let Some(errors) = errors.as_deref_mut() {
                    errors.unknown_ftrace_events.push(group_and_name.to_string());
                }
                continue;
            };

            // Events without a dedicated encoding would end up generic.
            if request.disable_generic_events && event.is_generic {
                if let Some(errors) = errors.as_deref_mut() {
                    errors.failed_ftrace_events.push(group_and_name.to_string());
                }
                continue;
            }

            self.enable_ftrace_event(&event, &mut filter, errors.as_deref_mut());
        }

        let syscall_filter = self.build_syscall_filter(&filter, request);
        self.set_syscall_event_filter(&syscall_filter)
            .context("Failed to set raw_syscalls filter")?;

        // There is no function_graph teardown in remove_config since the
        // tracer can't change while trace pipes are open, see
        // reset_current_tracer(). Filters accumulate across sessions.
        if request.enable_function_graph {
            if !self.current_state.funcgraph_on {
                self.ftrace.clear_function_filters()?;
                self.ftrace.clear_function_graph_filters()?;
            }
            self.ftrace.append_function_filters(&request.function_filters)?;
            self.ftrace
                .append_function_graph_filters(&request.function_graph_roots)?;
            if !self.current_state.funcgraph_on {
                if let Err(e) = self.ftrace.set_current_tracer("function_graph") {
                    info!(
                        "Unable to enable function_graph tracing since a concurrent ftrace \
                         data source is using a different tracer"
                    );
                    return Err(e.context("Failed to set function_graph tracer"));
                }
            }
            self.current_state.funcgraph_on = true;
        }

        let compact_format = self.table.compact_sched_format();
        let compact_sched = create_compact_sched_config(
            request.compact_sched.as_ref(),
            filter.is_event_enabled(compact_format.sched_switch_id),
            compact_format,
        );
        if !compact_format.format_valid {
            if let Some(errors) = errors.as_deref_mut() {
                errors
                    .failed_ftrace_events
                    .push("perfetto/compact_sched (unexpected sched event format)".to_string());
            }
        }

        let mut print_filter = None;
        if let Some(request_filter) = &request.print_filter {
            print_filter = FtracePrintFilterConfig::create(request_filter, &self.table);
            if print_filter.is_none() {
                if let Some(errors) = errors.as_deref_mut() {
                    errors
                        .failed_ftrace_events
                        .push("ftrace/print (unexpected format for filtering)".to_string());
                }
            }
        }

        let atrace_categories: BTreeSet<String> =
            request.atrace_categories.iter().cloned().collect();
        let prefer_sdk: BTreeSet<String> =
            request.atrace_categories_prefer_sdk.iter().cloned().collect();
        let atrace_categories_sdk_optout = atrace_categories
            .difference(&prefer_sdk)
            .cloned()
            .collect();

        let config = FtraceDataSourceConfig {
            event_filter: filter,
            syscall_filter,
            compact_sched,
            print_filter,
            atrace_apps: request.atrace_apps.iter().cloned().collect(),
            atrace_categories,
            atrace_categories_sdk_optout,
            symbolize_ksyms: request.symbolize_ksyms,
            buffer_percent: request.drain_buffer_percent,
            syscalls_returning_fd: self.get_syscalls_returning_fds(),
            kprobes,
        };
        self.ds_configs.insert(id, config);
        Ok(())
    }

    /// Starts `id` contributing to the trace. The first active session turns
    /// tracing_on on.
    pub fn activate_config(&mut self, id: FtraceConfigId) -> Result<()> {
        if id == 0 || !self.ds_configs.contains_key(&id) {
            bail!("Config {} not found", id);
        }

        let first_config = self.active_configs.is_empty();
        self.active_configs.insert(id);

        if let Err(e) = self.update_buffer_percent() {
            // Not fatal.
            error!(
                "Failed to set buffer_percent, check drain_buffer_percent and {} permissions: {:#}",
                self.ftrace.root_path().join("buffer_percent").display(),
                e
            );
        }

        if first_config {
            if let Err(e) = self.ftrace.set_tracing_on(true) {
                error!("Failed to enable ftrace: {:#}", e);
                self.active_configs.remove(&id);
                return Err(e.context("Failed to enable tracing_on"));
            }
        }
        Ok(())
    }

    /// Forgets session `id` and undoes whatever no remaining session needs.
    pub fn remove_config(&mut self, id: FtraceConfigId) -> Result<()> {
        if id == 0 || self.ds_configs.remove(&id).is_none() {
            bail!("Config {} not found", id);
        }

        let mut expected_ftrace_events = EventFilter::new();
        let mut expected_apps = BTreeSet::new();
        let mut expected_categories = BTreeSet::new();
        let mut expected_categories_sdk_optout = BTreeSet::new();
        for config in self.ds_configs.values() {
            expected_ftrace_events.enable_events_from(&config.event_filter);
            expected_apps.extend(config.atrace_apps.iter().cloned());
            expected_categories.extend(config.atrace_categories.iter().cloned());
            expected_categories_sdk_optout
                .extend(config.atrace_categories_sdk_optout.iter().cloned());
        }
        let expected_categories_prefer_sdk: BTreeSet<String> = expected_categories
            .difference(&expected_categories_sdk_optout)
            .cloned()
            .collect();

        // We may not have managed to turn on atrace for everything the
        // remaining sessions wanted, so only aim for what is actually on.
        let expected_apps: BTreeSet<String> = expected_apps
            .intersection(&self.current_state.atrace_apps)
            .cloned()
            .collect();
        let expected_categories: BTreeSet<String> = expected_categories
            .intersection(&self.current_state.atrace_categories)
            .cloned()
            .collect();

        // Both are subsets of the current state now, so sizes are enough.
        let atrace_changed = self.current_state.atrace_apps.len() != expected_apps.len()
            || self.current_state.atrace_categories.len() != expected_categories.len();
        let atrace_prefer_sdk_changed =
            self.current_state.atrace_categories_prefer_sdk != expected_categories_prefer_sdk;

        if let Err(e) = self.set_syscall_event_filter(&EventFilter::new()) {
            error!("Failed to set raw_syscalls filter in remove_config: {:#}", e);
        }

        for event_id in self.current_state.ftrace_events.get_enabled_events() {
            if expected_ftrace_events.is_event_enabled(event_id) {
                continue;
            }
            // Any event that was enabled must exist.
            let Some(event) = self.table.get_event_by_id(event_id).cloned() else {
                debug_assert!(false, "enabled event {} missing from table", event_id);
                continue;
            };
            if let Err(e) = self.ftrace.disable_event(&event.group, &event.name) {
                warn!("Failed to disable {}/{}: {:#}", event.group, event.name, e);
                continue;
            }
            self.current_state.ftrace_events.disable_event(event_id);

            let group_and_name = event.group_and_name();
            if group_and_name.is_kprobe_group() {
                self.uninstall_kprobe(&group_and_name);
            }
        }

        if self.active_configs.remove(&id) && self.active_configs.is_empty() {
            // Dormant sessions may still be around, but nobody is reading.
            if let Err(e) = self.ftrace.set_tracing_on(false) {
                warn!("Failed to turn off tracing: {:#}", e);
            }
        }

        if let Err(e) = self.update_buffer_percent() {
            warn!("Failed to update buffer_percent: {:#}", e);
        }

        // Idle sessions still depend on the buffer and clock setup, so the
        // rest is torn down only once all of them are gone.
        if self.ds_configs.is_empty() {
            self.teardown();
        }

        if self.current_state.atrace_on {
            if expected_apps.is_empty() && expected_categories.is_empty() {
                self.disable_atrace();
            } else if atrace_changed {
                // Categories that only enable ftrace events stay on until the
                // last session is gone, there's no way to drop them
                // individually.
                if self.start_atrace(&expected_apps, &expected_categories, None) {
                    self.current_state.atrace_apps = expected_apps;
                    self.current_state.atrace_categories = expected_categories;
                }
            }
        }

        if atrace_prefer_sdk_changed
            && self.set_atrace_prefer_sdk(&expected_categories_prefer_sdk, None)
        {
            self.current_state.atrace_categories_prefer_sdk = expected_categories_prefer_sdk;
        }

        Ok(())
    }

    /// Puts the nop tracer back after function_graph tracing. Only call this
    /// once every session is gone and trace pipes are closed.
    pub fn reset_current_tracer(&mut self) -> Result<()> {
        if !self.current_state.funcgraph_on {
            return Ok(());
        }
        self.ftrace
            .reset_current_tracer()
            .context("Failed to reset current_tracer to nop")?;
        self.current_state.funcgraph_on = false;
        self.ftrace
            .clear_function_filters()
            .context("Failed to reset set_ftrace_filter")?;
        self.ftrace
            .clear_function_graph_filters()
            .context("Failed to reset set_graph_function")?;
        Ok(())
    }

    fn teardown(&mut self) {
        if let Err(e) = self.ftrace.set_cpu_buffer_size_in_pages(1) {
            warn!("Failed to shrink ftrace buffer: {:#}", e);
        } else {
            self.current_state.cpu_buffer_size_pages = 1;
        }
        if let Err(e) = self.ftrace.set_buffer_percent(DEFAULT_BUFFER_PERCENT) {
            debug!("Failed to reset buffer_percent: {:#}", e);
        }
        match self.ftrace.disable_all_events() {
            Ok(()) => self.current_state.ftrace_events.clear(),
            Err(e) => debug!("Failed to disable all events: {:#}", e),
        }
        if let Err(e) = self.ftrace.clear_trace() {
            warn!("Failed to clear trace: {:#}", e);
        }
        if let Err(e) = self.ftrace.set_tracing_on(self.current_state.saved_tracing_on) {
            warn!("Failed to restore tracing_on: {:#}", e);
        }

        // Removing kprobes clears the trace buffers, so this has to wait
        // until nobody is tracing anymore.
        let probes = std::mem::take(&mut self.current_state.installed_kprobes);
        for probe in &probes {
            if let Err(e) = self.ftrace.remove_kprobe_event(probe.group(), probe.name()) {
                warn!("Failed to remove kprobe {}: {:#}", probe, e);
            }
            self.table.remove_event(probe);
        }
    }

    fn uninstall_kprobe(&mut self, probe: &GroupAndName) {
        if let Err(e) = self.ftrace.remove_kprobe_event(probe.group(), probe.name()) {
            warn!("Failed to remove kprobe {}: {:#}", probe, e);
        }
        self.table.remove_event(probe);
        self.current_state.installed_kprobes.remove(probe);
    }

    // ftrace/* events are always on and have no enable file, so they only
    // go into the session's filter.
    fn enable_ftrace_event(
        &mut self,
        event: &Event,
        filter: &mut EventFilter,
        errors: Option<&mut FtraceSetupErrors>,
    ) {
        let id = event.ftrace_event_id;
        if self.current_state.ftrace_events.is_event_enabled(id) || event.group == "ftrace" {
            filter.add_enabled_event(id);
            return;
        }
        match self.ftrace.enable_event(&event.group, &event.name) {
            Ok(()) => {
                self.current_state.ftrace_events.add_enabled_event(id);
                filter.add_enabled_event(id);
            }
            Err(e) => {
                debug!("Failed to enable {}/{}: {:#}", event.group, event.name, e);
                if let Some(errors) = errors {
                    errors.failed_ftrace_events.push(event.group_and_name().to_string());
                }
            }
        }
    }

    fn filter_has_group(&self, filter: &EventFilter, group: &str) -> bool {
        self.table
            .get_events_by_group(group)
            .iter()
            .any(|event| filter.is_event_enabled(event.ftrace_event_id))
    }

    fn build_syscall_filter(&self, filter: &EventFilter, request: &FtraceConfig) -> EventFilter {
        let mut output = EventFilter::new();
        if !self.filter_has_group(filter, "raw_syscalls") {
            return output;
        }

        if request.syscall_events.is_empty() {
            output.add_enabled_event(ALL_SYSCALLS_ID);
            return output;
        }

        for syscall in &request.syscall_events {
            match self.syscalls.get_by_name(syscall) {
                Some(id) => output.add_enabled_event(id),
                None => error!("Can't enable {}, syscall not known", syscall),
            }
        }
        output
    }

    // Applies the union of `extra_syscalls` and every session's syscall
    // filter, writing only if it changed.
    fn set_syscall_event_filter(&mut self, extra_syscalls: &EventFilter) -> Result<()> {
        let mut syscall_filter = EventFilter::new();
        syscall_filter.enable_events_from(extra_syscalls);
        for config in self.ds_configs.values() {
            syscall_filter.enable_events_from(&config.syscall_filter);
        }

        let mut filter_set = syscall_filter.get_enabled_events();
        if syscall_filter.is_event_enabled(ALL_SYSCALLS_ID) {
            filter_set.clear();
        }

        if self.current_state.syscall_filter != filter_set {
            self.ftrace.set_syscall_filter(&filter_set)?;
            self.current_state.syscall_filter = filter_set;
        }
        Ok(())
    }

    fn get_syscalls_returning_fds(&self) -> BTreeSet<i64> {
        SYSCALLS_RETURNING_FDS
            .iter()
            .filter_map(|name| self.syscalls.get_by_name(name))
            .map(|id| id as i64)
            .collect()
    }

    // Lowest non-zero percent across the active sessions. Left alone if no
    // active session asked for one.
    fn update_buffer_percent(&mut self) -> Result<()> {
        let min_percent = self
            .active_configs
            .iter()
            .filter_map(|id| self.ds_configs.get(id))
            .map(|config| config.buffer_percent)
            .filter(|percent| *percent > 0)
            .min();
        match min_percent {
            // Values over 100 are left for the kernel to reject.
            Some(percent) => self.ftrace.set_buffer_percent(percent),
            None => Ok(()),
        }
    }

    fn setup_clock(&mut self, request: &FtraceConfig) {
        let mut current_clock = self.ftrace.get_clock();
        let clocks = self.ftrace.available_clocks();

        if request.use_monotonic_raw_clock && clocks.contains(CLOCK_MONO_RAW) {
            match self.ftrace.set_clock(CLOCK_MONO_RAW) {
                Ok(()) => current_clock = CLOCK_MONO_RAW.to_string(),
                Err(e) => warn!("Failed to set clock {}: {:#}", CLOCK_MONO_RAW, e),
            }
        } else if let Some(clock) = CLOCKS.iter().find(|clock| clocks.contains(**clock)) {
            if current_clock != *clock {
                match self.ftrace.set_clock(clock) {
                    Ok(()) => current_clock = clock.to_string(),
                    Err(e) => warn!("Failed to set clock {}: {:#}", clock, e),
                }
            }
        }

        self.current_state.ftrace_clock = clock_from_name(&current_clock);
    }

    fn setup_buffer_size(&mut self, request: &FtraceConfig) {
        let pages = compute_cpu_buffer_size_in_pages(
            request.buffer_size_kb as usize,
            request.buffer_size_lower_bound,
            sysconf_phys_pages(),
        );
        if let Err(e) = self.ftrace.set_cpu_buffer_size_in_pages(pages) {
            warn!("Failed to set buffer size to {} pages: {:#}", pages, e);
        }
        self.current_state.cpu_buffer_size_pages = pages;
    }

    fn update_atrace(&mut self, request: &FtraceConfig, errors: Option<&mut String>) {
        // Work on copies so a failing atrace doesn't poison current_state.
        let request_categories: BTreeSet<String> =
            request.atrace_categories.iter().cloned().collect();
        let request_prefer_sdk: BTreeSet<String> =
            request.atrace_categories_prefer_sdk.iter().cloned().collect();

        let mut combined_categories = request_categories.clone();
        combined_categories.extend(self.current_state.atrace_categories.iter().cloned());
        let mut combined_apps: BTreeSet<String> = request.atrace_apps.iter().cloned().collect();
        combined_apps.extend(self.current_state.atrace_apps.iter().cloned());

        // Opting out of the SDK wins over preferring it.
        let mut combined_sdk_optout: BTreeSet<String> =
            request_categories.difference(&request_prefer_sdk).cloned().collect();
        combined_sdk_optout.extend(
            self.current_state
                .atrace_categories
                .difference(&self.current_state.atrace_categories_prefer_sdk)
                .cloned(),
        );
        let combined_prefer_sdk: BTreeSet<String> = combined_categories
            .difference(&combined_sdk_optout)
            .cloned()
            .collect();

        let mut errors = errors;
        if combined_prefer_sdk != self.current_state.atrace_categories_prefer_sdk
            && self.set_atrace_prefer_sdk(&combined_prefer_sdk, errors.as_deref_mut())
        {
            self.current_state.atrace_categories_prefer_sdk = combined_prefer_sdk;
        }

        if !self.current_state.atrace_on
            || combined_apps.len() != self.current_state.atrace_apps.len()
            || combined_categories.len() != self.current_state.atrace_categories.len()
        {
            if self.start_atrace(&combined_apps, &combined_categories, errors) {
                self.current_state.atrace_categories = combined_categories;
                self.current_state.atrace_apps = combined_apps;
                self.current_state.atrace_on = true;
            }
        }
    }

    fn start_atrace(
        &mut self,
        apps: &BTreeSet<String>,
        categories: &BTreeSet<String>,
        errors: Option<&mut String>,
    ) -> bool {
        let mut args = vec!["atrace".to_string(), "--async_start".to_string()];
        if self.atrace.supports_userspace_only() {
            args.push("--only_userspace".to_string());
        }
        args.extend(categories.iter().cloned());
        if !apps.is_empty() {
            args.push("-a".to_string());
            args.push(apps.iter().cloned().collect::<Vec<_>>().join(","));
        }

        debug!("Update atrace config...");
        let result = self.atrace.run_atrace(&args, errors);
        debug!("...done ({})", if result { "success" } else { "fail" });
        result
    }

    fn set_atrace_prefer_sdk(
        &mut self,
        categories: &BTreeSet<String>,
        errors: Option<&mut String>,
    ) -> bool {
        if !self.atrace.supports_prefer_sdk() {
            return false;
        }
        let mut args = vec!["atrace".to_string(), "--prefer_sdk".to_string()];
        args.extend(categories.iter().cloned());

        debug!("Update atrace prefer sdk categories...");
        let result = self.atrace.run_atrace(&args, errors);
        debug!("...done ({})", if result { "success" } else { "fail" });
        result
    }

    fn disable_atrace(&mut self) {
        debug_assert!(self.current_state.atrace_on);

        let mut args = vec!["atrace".to_string(), "--async_stop".to_string()];
        if self.atrace.supports_userspace_only() {
            args.push("--only_userspace".to_string());
        }
        debug!("Stop atrace...");
        if self.atrace.run_atrace(&args, None) {
            self.current_state.atrace_categories.clear();
            self.current_state.atrace_apps.clear();
            self.current_state.atrace_on = false;
        }
        debug!("...done");
    }
}
