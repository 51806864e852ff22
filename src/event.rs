//! Ftrace event identities and descriptors.
//!
//! Every event the kernel exposes lives under `events/<group>/<name>/` in
//! tracefs and carries a `format` file describing its numeric id and the
//! layout of its fields. [`Event`] is our parsed view of one of those.

use std::fmt;
use std::sync::LazyLock;

use anyhow::{anyhow, Result};
use regex::Regex;

/// Group for kprobes we install ourselves.
pub const KPROBE_GROUP: &str = "perfetto_kprobes";
/// Group for kretprobes we install ourselves.
pub const KRETPROBE_GROUP: &str = "perfetto_kretprobes";

/// An ftrace event identified by its group and name, e.g. `sched/sched_switch`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupAndName {
    group: String,
    name: String,
}

impl GroupAndName {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        GroupAndName {
            group: group.into(),
            name: name.into(),
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True for the groups reserved for the kprobes we create.
    pub fn is_kprobe_group(&self) -> bool {
        self.group == KPROBE_GROUP || self.group == KRETPROBE_GROUP
    }
}

impl fmt::Display for GroupAndName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.name)
    }
}

/// Splits a config entry of the form `name` or `group/name` into its parts.
/// The group is empty when none was given.
pub fn split_group_and_name(event: &str) -> (&str, &str) {
    match event.split_once('/') {
        Some((group, name)) => (group, name),
        None => ("", event),
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub type_and_name: String,
    pub offset: u32,
    pub size: u32,
    pub is_signed: bool,
}

/// Descriptor for an event known to the event table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Event {
    pub name: String,
    pub group: String,
    /// The kernel's numeric id for the event, used for filter membership.
    pub ftrace_event_id: usize,
    /// Set for events that have no dedicated encoding and would be emitted
    /// as generic key/value events.
    pub is_generic: bool,
    pub fields: Vec<Field>,
}

impl Event {
    pub fn new(group: &str, name: &str, ftrace_event_id: usize) -> Self {
        Event {
            name: name.to_string(),
            group: group.to_string(),
            ftrace_event_id,
            ..Default::default()
        }
    }

    pub fn group_and_name(&self) -> GroupAndName {
        GroupAndName::new(self.group.as_str(), self.name.as_str())
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// The parts of a tracefs `format` file we care about.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventFormat {
    pub name: String,
    pub id: usize,
    pub fields: Vec<Field>,
}

// Format files look like
//
// name: sched_switch
// ID: 316
// format:
// 	field:unsigned short common_type;	offset:0;	size:2;	signed:0;
// 	...
//
// print fmt: "..."
static FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*field:([^;]+);\s*offset:\s*(\d+);\s*size:\s*(\d+);\s*(?:signed:\s*(\d+);)?")
        .expect("Invalid event format field regex pattern")
});

pub fn parse_event_format(contents: &str) -> Result<EventFormat> {
    let mut format = EventFormat::default();
    let mut saw_id = false;
    for line in contents.lines() {
        if let Some(name) = line.strip_prefix("name:") {
            format.name = name.trim().to_string();
        } else if let Some(id) = line.strip_prefix("ID:") {
            format.id = id.trim().parse::<usize>()?;
            saw_id = true;
        } else if let Some(captures) = FIELD_RE.captures(line) {
            let type_and_name = captures[1].trim().to_string();
            format.fields.push(Field {
                name: field_name(&type_and_name).to_string(),
                offset: captures[2].parse()?,
                size: captures[3].parse()?,
                is_signed: captures.get(4).is_some_and(|s| s.as_str() == "1"),
                type_and_name,
            });
        }
    }

    if !saw_id {
        return Err(anyhow!("event format has no ID line"));
    }
    Ok(format)
}

// "char prev_comm[16]" -> "prev_comm"
fn field_name(type_and_name: &str) -> &str {
    let last = type_and_name.rsplit(' ').next().unwrap_or(type_and_name);
    match last.find('[') {
        Some(pos) => &last[..pos],
        None => last,
    }
}
