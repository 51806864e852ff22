//! Lookup from event names to [`Event`] descriptors.
//!
//! The table starts out with the events we have dedicated encodings for and
//! grows lazily: any other event a session asks for is materialized from its
//! tracefs format file as a generic event, and kprobes are materialized after
//! the backend has created them.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::compact_sched::CompactSchedFormat;
use crate::event::{parse_event_format, Event, GroupAndName};

/// Source of tracefs `events/<group>/<name>/format` contents.
pub trait EventFormatReader {
    fn read_event_format(&self, group: &str, name: &str) -> Option<String>;
}

impl EventFormatReader for HashMap<GroupAndName, String> {
    fn read_event_format(&self, group: &str, name: &str) -> Option<String> {
        self.get(&GroupAndName::new(group, name)).cloned()
    }
}

pub trait EventTable {
    /// Any event with this bare name, regardless of group.
    fn get_event_by_name(&self, name: &str) -> Option<&Event>;
    fn get_event(&self, group_and_name: &GroupAndName) -> Option<&Event>;
    fn get_or_create_event(&mut self, group_and_name: &GroupAndName) -> Option<&Event>;
    fn get_events_by_group(&self, group: &str) -> Vec<&Event>;
    fn get_event_by_id(&self, ftrace_event_id: usize) -> Option<&Event>;
    /// Materializes a kprobe the backend has already created.
    fn get_or_create_kprobe_event(&mut self, group_and_name: &GroupAndName) -> Option<&Event>;
    fn remove_event(&mut self, group_and_name: &GroupAndName);
    fn compact_sched_format(&self) -> &CompactSchedFormat;
}

// Events with a dedicated encoding. Everything else is generic.
const KNOWN_EVENTS: &[(&str, &str)] = &[
    ("binder", "binder_lock"),
    ("binder", "binder_locked"),
    ("binder", "binder_transaction"),
    ("binder", "binder_transaction_received"),
    ("binder", "binder_unlock"),
    ("block", "block_rq_complete"),
    ("block", "block_rq_issue"),
    ("cgroup", "cgroup_attach_task"),
    ("cgroup", "cgroup_mkdir"),
    ("cgroup", "cgroup_release"),
    ("cgroup", "cgroup_rename"),
    ("cgroup", "cgroup_rmdir"),
    ("clk", "clk_disable"),
    ("clk", "clk_enable"),
    ("clk", "clk_set_rate"),
    ("dmabuf_heap", "dma_heap_stat"),
    ("ftrace", "funcgraph_entry"),
    ("ftrace", "funcgraph_exit"),
    ("ftrace", "print"),
    ("gpu_mem", "gpu_mem_total"),
    ("ion", "ion_stat"),
    ("ipi", "ipi_entry"),
    ("ipi", "ipi_exit"),
    ("ipi", "ipi_raise"),
    ("irq", "irq_handler_entry"),
    ("irq", "irq_handler_exit"),
    ("irq", "softirq_entry"),
    ("irq", "softirq_exit"),
    ("irq", "softirq_raise"),
    ("kmem", "ion_heap_grow"),
    ("kmem", "ion_heap_shrink"),
    ("kmem", "mm_page_alloc"),
    ("kmem", "mm_page_free"),
    ("kmem", "rss_stat"),
    ("lowmemorykiller", "lowmemory_kill"),
    ("mm_event", "mm_event_record"),
    ("oom", "oom_score_adj_update"),
    ("power", "clock_disable"),
    ("power", "clock_enable"),
    ("power", "clock_set_rate"),
    ("power", "cpu_frequency"),
    ("power", "cpu_frequency_limits"),
    ("power", "cpu_idle"),
    ("power", "gpu_frequency"),
    ("power", "suspend_resume"),
    ("raw_syscalls", "sys_enter"),
    ("raw_syscalls", "sys_exit"),
    ("regulator", "regulator_disable"),
    ("regulator", "regulator_disable_complete"),
    ("regulator", "regulator_enable"),
    ("regulator", "regulator_enable_complete"),
    ("regulator", "regulator_set_voltage"),
    ("regulator", "regulator_set_voltage_complete"),
    ("sched", "sched_blocked_reason"),
    ("sched", "sched_cpu_hotplug"),
    ("sched", "sched_process_exec"),
    ("sched", "sched_process_exit"),
    ("sched", "sched_process_fork"),
    ("sched", "sched_process_free"),
    ("sched", "sched_process_hang"),
    ("sched", "sched_process_wait"),
    ("sched", "sched_switch"),
    ("sched", "sched_wakeup"),
    ("sched", "sched_wakeup_new"),
    ("sched", "sched_waking"),
    ("signal", "signal_deliver"),
    ("signal", "signal_generate"),
    ("synthetic", "rss_stat_throttled"),
    ("task", "task_newtask"),
    ("task", "task_rename"),
    ("thermal", "cdev_update"),
    ("thermal", "thermal_temperature"),
    ("vmscan", "mm_vmscan_direct_reclaim_begin"),
    ("vmscan", "mm_vmscan_direct_reclaim_end"),
    ("vmscan", "mm_vmscan_kswapd_sleep"),
    ("vmscan", "mm_vmscan_kswapd_wake"),
    ("workqueue", "workqueue_activate_work"),
    ("workqueue", "workqueue_execute_end"),
    ("workqueue", "workqueue_execute_start"),
    ("workqueue", "workqueue_queue_work"),
];

/// [`EventTable`] backed by format files.
pub struct TranslationTable<R: EventFormatReader> {
    reader: R,
    events: BTreeMap<usize, Event>,
    by_group_and_name: HashMap<GroupAndName, usize>,
    by_name: BTreeMap<String, usize>,
    by_group: BTreeMap<String, BTreeSet<usize>>,
    compact_sched_format: CompactSchedFormat,
}

impl<R: EventFormatReader> TranslationTable<R> {
    pub fn new(reader: R, events: Vec<Event>, compact_sched_format: CompactSchedFormat) -> Self {
        let mut table = TranslationTable {
            reader,
            events: BTreeMap::new(),
            by_group_and_name: HashMap::new(),
            by_name: BTreeMap::new(),
            by_group: BTreeMap::new(),
            compact_sched_format,
        };
        for event in events {
            table.insert(event);
        }
        table
    }

    /// Builds the table from the format files of every event we have a
    /// dedicated encoding for. Events the kernel doesn't have are skipped.
    pub fn create(reader: R) -> Self {
        let mut events = Vec::new();
        for (group, name) in KNOWN_EVENTS {
            let Some(contents) = reader.read_event_format(group, name) else {
                continue;
            };
            match parse_event_format(&contents) {
                Ok(format) if format.id != 0 => {
                    let mut event = Event::new(group, name, format.id);
                    event.fields = format.fields;
                    events.push(event);
                }
                Ok(_) => {}
                Err(e) => tracing::debug!("Failed to parse format of {}/{}: {}", group, name, e),
            }
        }

        let mut table = Self::new(reader, events, CompactSchedFormat::invalid());
        table.compact_sched_format = CompactSchedFormat::validate(
            table.get_event(&GroupAndName::new("sched", "sched_switch")),
            table.get_event(&GroupAndName::new("sched", "sched_waking")),
        );
        table
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn insert(&mut self, event: Event) {
        let id = event.ftrace_event_id;
        if let Some(existing) = self.events.get(&id) {
            tracing::warn!(
                "Event id {} of {}/{} already used by {}/{}",
                id,
                event.group,
                event.name,
                existing.group,
                existing.name
            );
            return;
        }
        self.by_group_and_name.insert(event.group_and_name(), id);
        self.by_name.entry(event.name.clone()).or_insert(id);
        self.by_group
            .entry(event.group.clone())
            .or_default()
            .insert(id);
        self.events.insert(id, event);
    }

    fn materialize(&mut self, group_and_name: &GroupAndName, is_generic: bool) -> Option<&Event> {
        if !self.by_group_and_name.contains_key(group_and_name) {
            let contents = self
                .reader
                .read_event_format(group_and_name.group(), group_and_name.name())?;
            let format = match parse_event_format(&contents) {
                Ok(format) => format,
                Err(e) => {
                    tracing::debug!("Failed to parse format of {}: {}", group_and_name, e);
                    return None;
                }
            };
            if format.id == 0 || self.events.contains_key(&format.id) {
                return None;
            }
            let mut event = Event::new(group_and_name.group(), group_and_name.name(), format.id);
            event.is_generic = is_generic;
            event.fields = format.fields;
            self.insert(event);
        }
        self.get_event(group_and_name)
    }
}

impl<R: EventFormatReader> EventTable for TranslationTable<R> {
    fn get_event_by_name(&self, name: &str) -> Option<&Event> {
        self.by_name.get(name).and_then(|id| self.events.get(id))
    }

    fn get_event(&self, group_and_name: &GroupAndName) -> Option<&Event> {
        self.by_group_and_name
            .get(group_and_name)
            .and_then(|id| self.events.get(id))
    }

    fn get_or_create_event(&mut self, group_and_name: &GroupAndName) -> Option<&Event> {
        self.materialize(group_and_name, true)
    }

    fn get_events_by_group(&self, group: &str) -> Vec<&Event> {
        self.by_group
            .get(group)
            .map(|ids| ids.iter().filter_map(|id| self.events.get(id)).collect())
            .unwrap_or_default()
    }

    fn get_event_by_id(&self, ftrace_event_id: usize) -> Option<&Event> {
        self.events.get(&ftrace_event_id)
    }

    fn get_or_create_kprobe_event(&mut self, group_and_name: &GroupAndName) -> Option<&Event> {
        self.materialize(group_and_name, false)
    }

    fn remove_event(&mut self, group_and_name: &GroupAndName) {
        let Some(id) = self.by_group_and_name.remove(group_and_name) else {
            return;
        };
        self.events.remove(&id);
        if self.by_name.get(group_and_name.name()) == Some(&id) {
            self.by_name.remove(group_and_name.name());
            // Fall back to another event sharing the bare name, if any.
            if let Some(other) = self
                .events
                .values()
                .find(|e| e.name == group_and_name.name())
            {
                self.by_name.insert(other.name.clone(), other.ftrace_event_id);
            }
        }
        if let Some(ids) = self.by_group.get_mut(group_and_name.group()) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_group.remove(group_and_name.group());
            }
        }
    }

    fn compact_sched_format(&self) -> &CompactSchedFormat {
        &self.compact_sched_format
    }
}
