//! Access to the kernel's ftrace control files.
//!
//! [`FtraceBackend`] is the narrow interface the muxer drives. [`Tracefs`]
//! implements it on top of a mounted tracefs (or an instance directory inside
//! one), tests implement it with a recording fake.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use crate::event_table::EventFormatReader;

const TRACEFS_ROOTS: &[&str] = &["/sys/kernel/tracing/", "/sys/kernel/debug/tracing/"];

pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

pub fn num_possible_cpus() -> usize {
    let cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if cpus <= 0 {
        1
    } else {
        cpus as usize
    }
}

pub trait FtraceBackend {
    fn root_path(&self) -> &Path;

    /// True if nobody else is using ftrace, i.e. the current tracer is `nop`.
    fn is_tracing_available(&self) -> bool;
    fn get_tracing_on(&self) -> bool;
    fn is_tracing_enabled(&self) -> bool {
        self.get_tracing_on()
    }
    fn set_tracing_on(&mut self, on: bool) -> Result<()>;

    fn enable_event(&mut self, group: &str, name: &str) -> Result<()>;
    fn disable_event(&mut self, group: &str, name: &str) -> Result<()>;
    fn disable_all_events(&mut self) -> Result<()>;
    /// Names of the events under `path`, e.g. `events/sched`.
    fn get_event_names_for_group(&self, path: &str) -> BTreeSet<String>;

    fn clear_trace(&mut self) -> Result<()>;

    fn get_clock(&self) -> String;
    fn available_clocks(&self) -> BTreeSet<String>;
    fn set_clock(&mut self, clock: &str) -> Result<()>;

    fn set_cpu_buffer_size_in_pages(&mut self, pages: usize) -> Result<()>;
    fn set_buffer_percent(&mut self, percent: u32) -> Result<()>;

    fn set_current_tracer(&mut self, tracer: &str) -> Result<()>;
    fn reset_current_tracer(&mut self) -> Result<()>;
    fn append_function_filters(&mut self, filters: &[String]) -> Result<()>;
    fn append_function_graph_filters(&mut self, filters: &[String]) -> Result<()>;
    fn clear_function_filters(&mut self) -> Result<()>;
    fn clear_function_graph_filters(&mut self) -> Result<()>;

    fn create_kprobe_event(&mut self, group: &str, name: &str, is_retprobe: bool) -> Result<()>;
    fn remove_kprobe_event(&mut self, group: &str, name: &str) -> Result<()>;

    /// Restricts raw_syscalls to `ids`. An empty set lifts the restriction.
    fn set_syscall_filter(&mut self, ids: &BTreeSet<usize>) -> Result<()>;

    fn supports_rss_stat_throttled(&self) -> bool;
}

#[derive(Clone, Debug)]
pub struct Tracefs {
    root: PathBuf,
}

impl Tracefs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Tracefs { root: root.into() }
    }

    /// Finds the mounted tracefs.
    pub fn discover() -> Result<Self> {
        for root in TRACEFS_ROOTS {
            let root = Path::new(root);
            if root.join("trace").exists() {
                return Ok(Tracefs::new(root));
            }
        }
        bail!(
            "tracefs not found, tried {}. Is it mounted?",
            TRACEFS_ROOTS.join(", ")
        );
    }

    /// Secondary instance `name` below this root, created if needed.
    pub fn instance(&self, name: &str) -> Result<Self> {
        if name.is_empty() || name.contains('/') || name.contains("..") {
            bail!("Invalid instance name '{}'", name);
        }
        let root = self.root.join("instances").join(name);
        if !root.exists() {
            fs::create_dir(&root)
                .with_context(|| format!("Failed to create instance {}", root.display()))?;
        }
        Ok(Tracefs::new(root))
    }

    fn write_to_file(&self, path: &str, contents: &str) -> Result<()> {
        let path = self.root.join(path);
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("Failed to write '{}' to {}", contents, path.display()))?;
        Ok(())
    }

    fn append_to_file(&self, path: &str, contents: &str) -> Result<()> {
        let path = self.root.join(path);
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.write_all(contents.as_bytes())
            .with_context(|| format!("Failed to append '{}' to {}", contents, path.display()))?;
        Ok(())
    }

    // Opening with O_TRUNC is how tracefs files get emptied.
    fn clear_file(&self, path: &str) -> Result<()> {
        let path = self.root.join(path);
        OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("Failed to clear {}", path.display()))?;
        Ok(())
    }

    fn read_file_into_string(&self, path: &str) -> Option<String> {
        fs::read_to_string(self.root.join(path)).ok()
    }

    fn current_tracer(&self) -> String {
        self.read_file_into_string("current_tracer")
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }

    fn append_filters(&self, path: &str, filters: &[String]) -> Result<()> {
        if filters.is_empty() {
            return Ok(());
        }
        let mut contents = filters.join("\n");
        contents.push('\n');
        self.append_to_file(path, &contents)
    }
}

impl EventFormatReader for Tracefs {
    fn read_event_format(&self, group: &str, name: &str) -> Option<String> {
        self.read_file_into_string(&format!("events/{}/{}/format", group, name))
    }
}

impl FtraceBackend for Tracefs {
    fn root_path(&self) -> &Path {
        &self.root
    }

    fn is_tracing_available(&self) -> bool {
        self.current_tracer() == "nop"
    }

    fn get_tracing_on(&self) -> bool {
        self.read_file_into_string("tracing_on")
            .is_some_and(|s| s.starts_with('1'))
    }

    fn set_tracing_on(&mut self, on: bool) -> Result<()> {
        self.write_to_file("tracing_on", if on { "1" } else { "0" })
    }

    fn enable_event(&mut self, group: &str, name: &str) -> Result<()> {
        let path = format!("events/{}/{}/enable", group, name);
        if self.write_to_file(&path, "1").is_ok() {
            return Ok(());
        }
        // Some kernels don't let us open the per-event enable file.
        self.append_to_file("set_event", &format!("{}:{}\n", group, name))
            .with_context(|| format!("Failed to enable {}/{}", group, name))
    }

    fn disable_event(&mut self, group: &str, name: &str) -> Result<()> {
        let path = format!("events/{}/{}/enable", group, name);
        if self.write_to_file(&path, "0").is_ok() {
            return Ok(());
        }
        self.append_to_file("set_event", &format!("!{}:{}\n", group, name))
            .with_context(|| format!("Failed to disable {}/{}", group, name))
    }

    fn disable_all_events(&mut self) -> Result<()> {
        self.write_to_file("events/enable", "0")
    }

    fn get_event_names_for_group(&self, path: &str) -> BTreeSet<String> {
        let Ok(entries) = fs::read_dir(self.root.join(path)) else {
            return BTreeSet::new();
        };
        entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect()
    }

    fn clear_trace(&mut self) -> Result<()> {
        self.clear_file("trace")?;
        // Offline CPUs may not have a per_cpu directory.
        for cpu in 0..num_possible_cpus() {
            let path = format!("per_cpu/cpu{}/trace", cpu);
            if let Err(e) = self.clear_file(&path) {
                tracing::debug!("{:#}", e);
            }
        }
        Ok(())
    }

    // trace_clock reads like "[local] global counter uptime perf mono boot".
    fn get_clock(&self) -> String {
        let contents = self.read_file_into_string("trace_clock").unwrap_or_default();
        contents
            .split_whitespace()
            .find_map(|clock| clock.strip_prefix('[').and_then(|c| c.strip_suffix(']')))
            .unwrap_or_default()
            .to_string()
    }

    fn available_clocks(&self) -> BTreeSet<String> {
        let contents = self.read_file_into_string("trace_clock").unwrap_or_default();
        contents
            .split_whitespace()
            .map(|clock| clock.trim_start_matches('[').trim_end_matches(']').to_string())
            .collect()
    }

    fn set_clock(&mut self, clock: &str) -> Result<()> {
        self.write_to_file("trace_clock", clock)
    }

    fn set_cpu_buffer_size_in_pages(&mut self, pages: usize) -> Result<()> {
        let kb = pages * page_size() / 1024;
        self.write_to_file("buffer_size_kb", &kb.to_string())
    }

    fn set_buffer_percent(&mut self, percent: u32) -> Result<()> {
        self.write_to_file("buffer_percent", &percent.to_string())
    }

    fn set_current_tracer(&mut self, tracer: &str) -> Result<()> {
        self.write_to_file("current_tracer", tracer)
    }

    fn reset_current_tracer(&mut self) -> Result<()> {
        self.write_to_file("current_tracer", "nop")
    }

    fn append_function_filters(&mut self, filters: &[String]) -> Result<()> {
        self.append_filters("set_ftrace_filter", filters)
    }

    fn append_function_graph_filters(&mut self, filters: &[String]) -> Result<()> {
        self.append_filters("set_graph_function", filters)
    }

    fn clear_function_filters(&mut self) -> Result<()> {
        self.clear_file("set_ftrace_filter")
    }

    fn clear_function_graph_filters(&mut self) -> Result<()> {
        self.clear_file("set_graph_function")
    }

    fn create_kprobe_event(&mut self, group: &str, name: &str, is_retprobe: bool) -> Result<()> {
        let kind = if is_retprobe { "r" } else { "p" };
        self.append_to_file(
            "kprobe_events",
            &format!("{}:{}/{} {}\n", kind, group, name, name),
        )
    }

    fn remove_kprobe_event(&mut self, group: &str, name: &str) -> Result<()> {
        self.append_to_file("kprobe_events", &format!("-:{}/{}\n", group, name))
    }

    fn set_syscall_filter(&mut self, ids: &BTreeSet<usize>) -> Result<()> {
        let filter = if ids.is_empty() {
            "0".to_string()
        } else {
            ids.iter()
                .map(|id| format!("id == {}", id))
                .collect::<Vec<_>>()
                .join(" || ")
        };
        for event in ["sys_enter", "sys_exit"] {
            self.write_to_file(&format!("events/raw_syscalls/{}/filter", event), &filter)?;
        }
        Ok(())
    }

    fn supports_rss_stat_throttled(&self) -> bool {
        self.root
            .join("events/synthetic/rss_stat_throttled")
            .exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(root: &Path, path: &str, contents: &str) {
        let path = root.join(path);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn read(root: &Path, path: &str) -> String {
        fs::read_to_string(root.join(path)).unwrap()
    }

    fn fake_tracefs() -> (TempDir, Tracefs) {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        touch(root, "trace", "# tracer: nop\n");
        touch(root, "tracing_on", "1\n");
        touch(root, "current_tracer", "nop\n");
        touch(root, "trace_clock", "[local] global boot\n");
        touch(root, "buffer_size_kb", "1408\n");
        touch(root, "set_event", "");
        touch(root, "set_ftrace_filter", "");
        touch(root, "set_graph_function", "");
        touch(root, "kprobe_events", "");
        touch(root, "events/enable", "0\n");
        touch(root, "events/sched/sched_switch/enable", "0\n");
        touch(root, "events/sched/sched_waking/enable", "0\n");
        touch(root, "events/sched/enable", "0\n");
        touch(root, "events/raw_syscalls/sys_enter/filter", "none\n");
        touch(root, "events/raw_syscalls/sys_exit/filter", "none\n");
        let tracefs = Tracefs::new(root);
        (dir, tracefs)
    }

    #[test]
    fn test_tracing_on() {
        let (dir, mut tracefs) = fake_tracefs();
        assert!(tracefs.get_tracing_on());
        assert!(tracefs.is_tracing_enabled());
        tracefs.set_tracing_on(false).unwrap();
        assert_eq!(read(dir.path(), "tracing_on"), "0");
        assert!(!tracefs.get_tracing_on());
    }

    #[test]
    fn test_tracing_available() {
        let (dir, tracefs) = fake_tracefs();
        assert!(tracefs.is_tracing_available());
        touch(dir.path(), "current_tracer", "function\n");
        assert!(!tracefs.is_tracing_available());
    }

    #[test]
    fn test_enable_event() {
        let (dir, mut tracefs) = fake_tracefs();
        tracefs.enable_event("sched", "sched_switch").unwrap();
        assert_eq!(read(dir.path(), "events/sched/sched_switch/enable"), "1");
        tracefs.disable_event("sched", "sched_switch").unwrap();
        assert_eq!(read(dir.path(), "events/sched/sched_switch/enable"), "0");
    }

    #[test]
    fn test_enable_event_falls_back_to_set_event() {
        let (dir, mut tracefs) = fake_tracefs();
        tracefs.enable_event("power", "cpu_idle").unwrap();
        tracefs.disable_event("power", "cpu_idle").unwrap();
        assert_eq!(read(dir.path(), "set_event"), "power:cpu_idle\n!power:cpu_idle\n");
    }

    #[test]
    fn test_event_names_for_group() {
        let (_dir, tracefs) = fake_tracefs();
        let names = tracefs.get_event_names_for_group("events/sched");
        assert_eq!(
            names,
            BTreeSet::from(["sched_switch".to_string(), "sched_waking".to_string()])
        );
        assert!(tracefs.get_event_names_for_group("events/nope").is_empty());
    }

    #[test]
    fn test_clocks() {
        let (dir, mut tracefs) = fake_tracefs();
        assert_eq!(tracefs.get_clock(), "local");
        assert_eq!(
            tracefs.available_clocks(),
            BTreeSet::from(["boot".to_string(), "global".to_string(), "local".to_string()])
        );
        tracefs.set_clock("boot").unwrap();
        assert_eq!(read(dir.path(), "trace_clock"), "boot");

        touch(dir.path(), "trace_clock", "");
        assert_eq!(tracefs.get_clock(), "");
        assert!(tracefs.available_clocks().is_empty());
    }

    #[test]
    fn test_buffer_size() {
        let (dir, mut tracefs) = fake_tracefs();
        tracefs.set_cpu_buffer_size_in_pages(4).unwrap();
        assert_eq!(
            read(dir.path(), "buffer_size_kb"),
            (4 * page_size() / 1024).to_string()
        );
    }

    #[test]
    fn test_clear_trace() {
        let (dir, mut tracefs) = fake_tracefs();
        touch(dir.path(), "per_cpu/cpu0/trace", "data");
        tracefs.clear_trace().unwrap();
        assert_eq!(read(dir.path(), "trace"), "");
        assert_eq!(read(dir.path(), "per_cpu/cpu0/trace"), "");
    }

    #[test]
    fn test_kprobes() {
        let (dir, mut tracefs) = fake_tracefs();
        tracefs
            .create_kprobe_event("perfetto_kprobes", "do_sys_open", false)
            .unwrap();
        tracefs
            .create_kprobe_event("perfetto_kretprobes", "do_sys_open", true)
            .unwrap();
        tracefs
            .remove_kprobe_event("perfetto_kprobes", "do_sys_open")
            .unwrap();
        assert_eq!(
            read(dir.path(), "kprobe_events"),
            "p:perfetto_kprobes/do_sys_open do_sys_open\n\
             r:perfetto_kretprobes/do_sys_open do_sys_open\n\
             -:perfetto_kprobes/do_sys_open\n"
        );
    }

    #[test]
    fn test_syscall_filter() {
        let (dir, mut tracefs) = fake_tracefs();
        tracefs.set_syscall_filter(&BTreeSet::from([0, 1])).unwrap();
        assert_eq!(
            read(dir.path(), "events/raw_syscalls/sys_enter/filter"),
            "id == 0 || id == 1"
        );
        assert_eq!(
            read(dir.path(), "events/raw_syscalls/sys_exit/filter"),
            "id == 0 || id == 1"
        );
        tracefs.set_syscall_filter(&BTreeSet::new()).unwrap();
        assert_eq!(read(dir.path(), "events/raw_syscalls/sys_enter/filter"), "0");
    }

    #[test]
    fn test_function_filters() {
        let (dir, mut tracefs) = fake_tracefs();
        tracefs
            .append_function_filters(&["vfs_read".to_string(), "vfs_write".to_string()])
            .unwrap();
        tracefs.append_function_graph_filters(&[]).unwrap();
        assert_eq!(read(dir.path(), "set_ftrace_filter"), "vfs_read\nvfs_write\n");
        assert_eq!(read(dir.path(), "set_graph_function"), "");
        tracefs.clear_function_filters().unwrap();
        assert_eq!(read(dir.path(), "set_ftrace_filter"), "");
    }

    #[test]
    fn test_read_event_format() {
        let (dir, tracefs) = fake_tracefs();
        touch(dir.path(), "events/sched/sched_switch/format", "name: sched_switch\nID: 1\n");
        assert!(tracefs
            .read_event_format("sched", "sched_switch")
            .unwrap()
            .contains("ID: 1"));
        assert!(tracefs.read_event_format("sched", "nope").is_none());
    }

    #[test]
    fn test_instance() {
        let (dir, tracefs) = fake_tracefs();
        fs::create_dir(dir.path().join("instances")).unwrap();
        let instance = tracefs.instance("mux").unwrap();
        assert_eq!(instance.root_path(), dir.path().join("instances/mux"));
        assert!(instance.root_path().is_dir());
        assert!(tracefs.instance("../escape").is_err());
    }

    #[test]
    fn test_rss_stat_throttled() {
        let (dir, tracefs) = fake_tracefs();
        assert!(!tracefs.supports_rss_stat_throttled());
        touch(dir.path(), "events/synthetic/rss_stat_throttled/enable", "0");
        assert!(tracefs.supports_rss_stat_throttled());
    }
}
