//! The ftrace events behind each atrace category.
//!
//! Kept in line with the category list of atrace itself. Falling out of sync
//! isn't fatal since configs can always name the ftrace events directly, but
//! this keeps configs short.

use std::collections::BTreeSet;

use crate::event::GroupAndName;
use crate::event_table::EventTable;

struct AtraceCategory {
    name: &'static str,
    // Groups whose known events are all enabled.
    groups: &'static [&'static str],
    events: &'static [(&'static str, &'static str)],
}

const CATEGORIES: &[AtraceCategory] = &[
    AtraceCategory {
        name: "gfx",
        groups: &["mdss", "mali", "sde", "dpu", "g2d", "panel"],
        events: &[
            ("mdss", "rotator_bw_ao_as_context"),
            ("mdss", "mdp_trace_counter"),
            ("mdss", "tracing_mark_write"),
            ("mdss", "mdp_cmd_wait_pingpong"),
            ("mdss", "mdp_cmd_kickoff"),
            ("mdss", "mdp_cmd_release_bw"),
            ("mdss", "mdp_cmd_readptr_done"),
            ("mdss", "mdp_cmd_pingpong_done"),
            ("mdss", "mdp_misr_crc"),
            ("mdss", "mdp_compare_bw"),
            ("mdss", "mdp_perf_update_bus"),
            ("mdss", "mdp_video_underrun_done"),
            ("mdss", "mdp_commit"),
            ("mdss", "mdp_mixer_update"),
            ("mdss", "mdp_perf_prefill_calc"),
            ("mdss", "mdp_perf_set_ot"),
            ("mdss", "mdp_perf_set_wm_levels"),
            ("mdss", "mdp_perf_set_panic_luts"),
            ("mdss", "mdp_perf_set_qos_luts"),
            ("mdss", "mdp_sspp_change"),
            ("mdss", "mdp_sspp_set"),
            ("mali", "tracing_mark_write"),
            ("sde", "tracing_mark_write"),
            ("sde", "sde_perf_update_bus"),
            ("sde", "sde_perf_set_qos_luts"),
            ("sde", "sde_perf_set_ot"),
            ("sde", "sde_perf_set_danger_luts"),
            ("sde", "sde_perf_crtc_update"),
            ("sde", "sde_perf_calc_crtc"),
            ("sde", "sde_evtlog"),
            ("sde", "sde_encoder_underrun"),
            ("sde", "sde_cmd_release_bw"),
            ("dpu", "tracing_mark_write"),
            ("dpu", "disp_dpu_underrun"),
            ("g2d", "tracing_mark_write"),
            ("g2d", "g2d_perf_update_qos"),
            ("panel", "panel_write_generic"),
        ],
    },
    AtraceCategory {
        name: "ion",
        groups: &[],
        events: &[("kmem", "ion_alloc_buffer_start")],
    },
    AtraceCategory {
        name: "sched",
        groups: &["cgroup", "systrace", "scm"],
        events: &[
            ("sched", "sched_switch"),
            ("sched", "sched_waking"),
            ("sched", "sched_blocked_reason"),
            ("sched", "sched_cpu_hotplug"),
            ("sched", "sched_pi_setprio"),
            ("sched", "sched_process_exit"),
            ("cgroup", "cgroup_transfer_tasks"),
            ("cgroup", "cgroup_setup_root"),
            ("cgroup", "cgroup_rmdir"),
            ("cgroup", "cgroup_rename"),
            ("cgroup", "cgroup_remount"),
            ("cgroup", "cgroup_release"),
            ("cgroup", "cgroup_mkdir"),
            ("cgroup", "cgroup_destroy_root"),
            ("cgroup", "cgroup_attach_task"),
            ("oom", "oom_score_adj_update"),
            ("task", "task_rename"),
            ("task", "task_newtask"),
            ("systrace", "0"),
            ("scm", "scm_call_start"),
            ("scm", "scm_call_end"),
        ],
    },
    AtraceCategory {
        name: "irq",
        groups: &["irq", "ipi"],
        events: &[
            ("irq", "tasklet_hi_exit"),
            ("irq", "tasklet_hi_entry"),
            ("irq", "tasklet_exit"),
            ("irq", "tasklet_entry"),
            ("irq", "softirq_raise"),
            ("irq", "softirq_exit"),
            ("irq", "softirq_entry"),
            ("irq", "irq_handler_exit"),
            ("irq", "irq_handler_entry"),
            ("ipi", "ipi_raise"),
            ("ipi", "ipi_exit"),
            ("ipi", "ipi_entry"),
        ],
    },
    AtraceCategory {
        name: "irqoff",
        groups: &[],
        events: &[("preemptirq", "irq_enable"), ("preemptirq", "irq_disable")],
    },
    AtraceCategory {
        name: "preemptoff",
        groups: &[],
        events: &[
            ("preemptirq", "preempt_enable"),
            ("preemptirq", "preempt_disable"),
        ],
    },
    AtraceCategory {
        name: "i2c",
        groups: &["i2c"],
        events: &[
            ("i2c", "i2c_read"),
            ("i2c", "i2c_write"),
            ("i2c", "i2c_result"),
            ("i2c", "i2c_reply"),
            ("i2c", "smbus_read"),
            ("i2c", "smbus_write"),
            ("i2c", "smbus_result"),
            ("i2c", "smbus_reply"),
        ],
    },
    AtraceCategory {
        name: "freq",
        groups: &["msm_bus"],
        events: &[
            ("power", "cpu_frequency"),
            ("power", "gpu_frequency"),
            ("power", "clock_set_rate"),
            ("power", "clock_disable"),
            ("power", "clock_enable"),
            ("clk", "clk_set_rate"),
            ("clk", "clk_disable"),
            ("clk", "clk_enable"),
            ("power", "cpu_frequency_limits"),
            ("power", "suspend_resume"),
            ("cpuhp", "cpuhp_enter"),
            ("cpuhp", "cpuhp_exit"),
            ("cpuhp", "cpuhp_pause"),
            ("msm_bus", "bus_update_request_end"),
            ("msm_bus", "bus_update_request"),
            ("msm_bus", "bus_rules_matches"),
            ("msm_bus", "bus_max_votes"),
            ("msm_bus", "bus_client_status"),
            ("msm_bus", "bus_bke_params"),
            ("msm_bus", "bus_bimc_config_limiter"),
            ("msm_bus", "bus_avail_bw"),
            ("msm_bus", "bus_agg_bw"),
        ],
    },
    AtraceCategory {
        name: "membus",
        groups: &["memory_bus"],
        events: &[],
    },
    AtraceCategory {
        name: "idle",
        groups: &[],
        events: &[("power", "cpu_idle")],
    },
    AtraceCategory {
        name: "disk",
        groups: &[],
        events: &[
            ("f2fs", "f2fs_sync_file_enter"),
            ("f2fs", "f2fs_sync_file_exit"),
            ("f2fs", "f2fs_write_begin"),
            ("f2fs", "f2fs_write_end"),
            ("f2fs", "f2fs_iostat"),
            ("f2fs", "f2fs_iostat_latency"),
            ("ext4", "ext4_da_write_begin"),
            ("ext4", "ext4_da_write_end"),
            ("ext4", "ext4_sync_file_enter"),
            ("ext4", "ext4_sync_file_exit"),
            ("block", "block_bio_queue"),
            ("block", "block_bio_complete"),
            ("ufs", "ufshcd_command"),
        ],
    },
    AtraceCategory {
        name: "mmc",
        groups: &["mmc"],
        events: &[],
    },
    AtraceCategory {
        name: "load",
        groups: &["cpufreq_interactive"],
        events: &[],
    },
    AtraceCategory {
        name: "sync",
        groups: &["sync", "fence", "dma_fence"],
        events: &[
            ("sync", "sync_pt"),
            ("sync", "sync_timeline"),
            ("sync", "sync_wait"),
            ("fence", "fence_annotate_wait_on"),
            ("fence", "fence_destroy"),
            ("fence", "fence_emit"),
            ("fence", "fence_enable_signal"),
            ("fence", "fence_init"),
            ("fence", "fence_signaled"),
            ("fence", "fence_wait_end"),
            ("fence", "fence_wait_start"),
        ],
    },
    AtraceCategory {
        name: "workq",
        groups: &["workqueue"],
        events: &[
            ("workqueue", "workqueue_queue_work"),
            ("workqueue", "workqueue_execute_start"),
            ("workqueue", "workqueue_execute_end"),
            ("workqueue", "workqueue_activate_work"),
        ],
    },
    AtraceCategory {
        name: "memreclaim",
        groups: &["lowmemorykiller"],
        events: &[
            ("vmscan", "mm_vmscan_direct_reclaim_begin"),
            ("vmscan", "mm_vmscan_direct_reclaim_end"),
            ("vmscan", "mm_vmscan_kswapd_wake"),
            ("vmscan", "mm_vmscan_kswapd_sleep"),
            ("lowmemorykiller", "lowmemory_kill"),
        ],
    },
    AtraceCategory {
        name: "regulators",
        groups: &["regulator"],
        events: &[
            ("regulator", "regulator_set_voltage_complete"),
            ("regulator", "regulator_set_voltage"),
            ("regulator", "regulator_enable_delay"),
            ("regulator", "regulator_enable_complete"),
            ("regulator", "regulator_enable"),
            ("regulator", "regulator_disable_complete"),
            ("regulator", "regulator_disable"),
        ],
    },
    AtraceCategory {
        name: "binder_driver",
        groups: &[],
        events: &[
            ("binder", "binder_transaction"),
            ("binder", "binder_transaction_received"),
            ("binder", "binder_transaction_alloc_buf"),
            ("binder", "binder_set_priority"),
        ],
    },
    AtraceCategory {
        name: "binder_lock",
        groups: &[],
        events: &[
            ("binder", "binder_lock"),
            ("binder", "binder_locked"),
            ("binder", "binder_unlock"),
        ],
    },
    AtraceCategory {
        name: "pagecache",
        groups: &["filemap"],
        events: &[
            ("filemap", "mm_filemap_delete_from_page_cache"),
            ("filemap", "mm_filemap_add_to_page_cache"),
            ("filemap", "filemap_set_wb_err"),
            ("filemap", "file_check_and_advance_wb_err"),
        ],
    },
    // rss_stat is added separately, see add_atrace_category_events().
    AtraceCategory {
        name: "memory",
        groups: &[],
        events: &[
            ("kmem", "ion_heap_grow"),
            ("kmem", "ion_heap_shrink"),
            ("ion", "ion_stat"),
            ("mm_event", "mm_event_record"),
            ("dmabuf_heap", "dma_heap_stat"),
            ("gpu_mem", "gpu_mem_total"),
        ],
    },
    AtraceCategory {
        name: "thermal",
        groups: &[],
        events: &[
            ("thermal", "thermal_temperature"),
            ("thermal", "cdev_update"),
        ],
    },
    AtraceCategory {
        name: "camera",
        groups: &["lwis"],
        events: &[("lwis", "tracing_mark_write")],
    },
];

/// Adds the ftrace events behind `category` to `events`. Returns false for
/// categories we don't know, which are otherwise ignored since atrace may be
/// newer than us.
pub fn add_atrace_category_events(
    category: &str,
    table: &dyn EventTable,
    supports_rss_stat_throttled: bool,
    events: &mut BTreeSet<GroupAndName>,
) -> bool {
    let Some(entry) = CATEGORIES.iter().find(|c| c.name == category) else {
        return false;
    };

    for group in entry.groups {
        for event in table.get_events_by_group(group) {
            events.insert(GroupAndName::new(*group, event.name.as_str()));
        }
    }
    for (group, name) in entry.events {
        events.insert(GroupAndName::new(*group, *name));
    }

    if category == "memory" {
        if supports_rss_stat_throttled {
            events.insert(GroupAndName::new("synthetic", "rss_stat_throttled"));
        } else {
            events.insert(GroupAndName::new("kmem", "rss_stat"));
        }
    }
    true
}
