use std::collections::HashMap;

use syscalls::Sysno;

/// Syscall ids above this are never valid. The id right after it is used as
/// the "all syscalls" marker in filters.
pub const MAX_SYSCALLS: usize = 550;

/// Maps `sys_<name>` to the syscall id on the target architecture.
#[derive(Clone, Debug, Default)]
pub struct SyscallTable {
    ids: HashMap<String, usize>,
}

impl SyscallTable {
    /// Table for the architecture we're running on.
    pub fn native() -> Self {
        let ids = (0..MAX_SYSCALLS)
            .filter_map(|nr| Sysno::new(nr).map(|sysno| (format!("sys_{}", sysno.name()), nr)))
            .collect();
        SyscallTable { ids }
    }

    /// A table where each syscall's id is its position in `names`.
    pub fn from_names(names: &[&str]) -> Self {
        let ids = names
            .iter()
            .enumerate()
            .map(|(nr, name)| (name.to_string(), nr))
            .collect();
        SyscallTable { ids }
    }

    pub fn get_by_name(&self, name: &str) -> Option<usize> {
        self.ids.get(name).copied()
    }
}
