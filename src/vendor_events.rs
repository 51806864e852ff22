//! Vendor-specific atrace categories.
//!
//! Devices can ship extra ftrace events for an atrace category. The file
//! lists each category on an unindented line followed by its events, one
//! `group/name` per indented line:
//!
//! ```text
//! gfx
//!  mali/mali_pm_status
//!  mali/mali_job_slots_event
//! ion
//!  kmem/ion_alloc_buffer_start
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::event::GroupAndName;

pub type VendorEvents = BTreeMap<String, Vec<GroupAndName>>;

pub fn parse_vendor_events(contents: &str) -> Result<VendorEvents> {
    let mut vendor_events = VendorEvents::new();
    let mut category: Option<String> = None;

    for (lineno, line) in contents.lines().enumerate() {
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }

        if !line.starts_with(char::is_whitespace) {
            let name = line.trim().to_string();
            vendor_events.entry(name.clone()).or_default();
            category = Some(name);
            continue;
        }

        let Some(current) = category.as_ref() else {
            bail!("line {}: event listed before any category", lineno + 1);
        };
        let Some((group, name)) = line.trim().split_once('/') else {
            bail!("line {}: expected group/name, got '{}'", lineno + 1, line.trim());
        };
        if let Some(events) = vendor_events.get_mut(current) {
            events.push(GroupAndName::new(group, name));
        }
    }

    Ok(vendor_events)
}

pub fn load_vendor_events(path: &Path) -> Result<VendorEvents> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read vendor categories {}", path.display()))?;
    parse_vendor_events(&contents)
        .with_context(|| format!("Failed to parse vendor categories {}", path.display()))
}
