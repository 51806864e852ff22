//! Compact encoding for the scheduler's two hottest events.
//!
//! The compact form interns fields of `sched_switch` and `sched_waking`, so it
//! can only be used when both events have the field layout it knows how to
//! read. The layout check happens once when the event table is built, the
//! per-session decision happens at setup time.

use crate::config::CompactSchedRequest;
use crate::event::Event;

const SCHED_SWITCH_FIELDS: &[&str] = &["prev_state", "next_pid", "next_prio", "next_comm"];
const SCHED_WAKING_FIELDS: &[&str] = &["pid", "target_cpu", "prio", "comm"];

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactSchedFormat {
    // False if either event is missing or lacks one of the fields we intern.
    pub format_valid: bool,
    pub sched_switch_id: usize,
    pub sched_waking_id: usize,
}

impl CompactSchedFormat {
    pub fn validate(sched_switch: Option<&Event>, sched_waking: Option<&Event>) -> Self {
        let (Some(switch), Some(waking)) = (sched_switch, sched_waking) else {
            return Self::invalid();
        };

        let has_fields =
            |event: &Event, fields: &[&str]| fields.iter().all(|f| event.field(f).is_some());
        if !has_fields(switch, SCHED_SWITCH_FIELDS) || !has_fields(waking, SCHED_WAKING_FIELDS) {
            tracing::debug!("sched_switch/sched_waking layout unsuitable for compact encoding");
            return Self::invalid();
        }

        CompactSchedFormat {
            format_valid: true,
            sched_switch_id: switch.ftrace_event_id,
            sched_waking_id: waking.ftrace_event_id,
        }
    }

    pub fn invalid() -> Self {
        Self::default()
    }
}

/// Per-session compact sched setting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactSchedConfig {
    pub enabled: bool,
}

/// Compact encoding is on by default, but only if the session actually
/// records sched_switch and the kernel's format is one we can handle.
pub fn create_compact_sched_config(
    request: Option<&CompactSchedRequest>,
    switch_requested: bool,
    format: &CompactSchedFormat,
) -> CompactSchedConfig {
    if !format.format_valid || !switch_requested {
        return CompactSchedConfig { enabled: false };
    }
    let explicitly_disabled = request.and_then(|r| r.enabled) == Some(false);
    CompactSchedConfig {
        enabled: !explicitly_disabled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Field;

    fn event_with_fields(group: &str, name: &str, id: usize, fields: &[&str]) -> Event {
        let mut event = Event::new(group, name, id);
        event.fields = fields
            .iter()
            .map(|f| Field {
                name: f.to_string(),
                ..Default::default()
            })
            .collect();
        event
    }

    fn valid_format() -> CompactSchedFormat {
        let switch = event_with_fields("sched", "sched_switch", 1, SCHED_SWITCH_FIELDS);
        let waking = event_with_fields("sched", "sched_waking", 2, SCHED_WAKING_FIELDS);
        CompactSchedFormat::validate(Some(&switch), Some(&waking))
    }

    #[test]
    fn test_validate_format() {
        let format = valid_format();
        assert!(format.format_valid);
        assert_eq!(format.sched_switch_id, 1);
        assert_eq!(format.sched_waking_id, 2);
    }

    #[test]
    fn test_validate_missing_field() {
        let switch = event_with_fields("sched", "sched_switch", 1, &["prev_state", "next_pid"]);
        let waking = event_with_fields("sched", "sched_waking", 2, SCHED_WAKING_FIELDS);
        assert!(!CompactSchedFormat::validate(Some(&switch), Some(&waking)).format_valid);
        assert!(!CompactSchedFormat::validate(None, Some(&waking)).format_valid);
    }

    #[test]
    fn test_enabled_by_default() {
        let config = create_compact_sched_config(None, true, &valid_format());
        assert!(config.enabled);

        let request = CompactSchedRequest { enabled: Some(true) };
        assert!(create_compact_sched_config(Some(&request), true, &valid_format()).enabled);
    }

    #[test]
    fn test_disabled() {
        let request = CompactSchedRequest {
            enabled: Some(false),
        };
        assert!(!create_compact_sched_config(Some(&request), true, &valid_format()).enabled);
        // sched_switch not being recorded.
        assert!(!create_compact_sched_config(None, false, &valid_format()).enabled);
        assert!(!create_compact_sched_config(None, true, &CompactSchedFormat::invalid()).enabled);
    }
}
