use crate::config::PrintFilter;
use crate::event::GroupAndName;
use crate::event_table::EventTable;

#[derive(Clone, Debug, PartialEq, Eq)]
enum Matcher {
    Prefix(String),
    // Atrace writes "<type>|<pid>|<message>" into ftrace/print.
    AtraceMessage { msg_type: char, prefix: String },
}

impl Matcher {
    fn matches(&self, buf: &str) -> bool {
        match self {
            Matcher::Prefix(prefix) => buf.starts_with(prefix.as_str()),
            Matcher::AtraceMessage { msg_type, prefix } => {
                let mut parts = buf.splitn(3, '|');
                let (Some(ty), Some(pid), Some(message)) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    return false;
                };
                let mut ty_chars = ty.chars();
                ty_chars.next() == Some(*msg_type)
                    && ty_chars.next().is_none()
                    && !pid.is_empty()
                    && pid.bytes().all(|b| b.is_ascii_digit())
                    && message.starts_with(prefix.as_str())
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Rule {
    matcher: Matcher,
    allow: bool,
}

/// Decides which `ftrace/print` events a session keeps, based on the
/// contents of their `buf` field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FtracePrintFilterConfig {
    rules: Vec<Rule>,
    print_event_id: usize,
}

impl FtracePrintFilterConfig {
    /// Returns None if `ftrace/print` isn't in the table or has no `buf`
    /// field, since there is nothing we could match on.
    pub fn create(filter: &PrintFilter, table: &dyn EventTable) -> Option<Self> {
        let print = table.get_event(&GroupAndName::new("ftrace", "print"))?;
        print.field("buf")?;

        let rules = filter
            .rules
            .iter()
            .filter_map(|rule| {
                let matcher = if let Some(prefix) = &rule.prefix {
                    Matcher::Prefix(prefix.clone())
                } else {
                    let msg = rule.atrace_msg.as_ref()?;
                    Matcher::AtraceMessage {
                        msg_type: msg.msg_type.chars().next()?,
                        prefix: msg.prefix.clone(),
                    }
                };
                Some(Rule {
                    matcher,
                    allow: rule.allow,
                })
            })
            .collect();

        Some(FtracePrintFilterConfig {
            rules,
            print_event_id: print.ftrace_event_id,
        })
    }

    pub fn print_event_id(&self) -> usize {
        self.print_event_id
    }

    /// First matching rule wins. Anything no rule matches is kept.
    pub fn is_event_interesting(&self, buf: &str) -> bool {
        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(buf))
            .map_or(true, |rule| rule.allow)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::compact_sched::CompactSchedFormat;
    use crate::config::{AtraceMessageMatch, PrintFilterRule};
    use crate::event::{Event, Field};
    use crate::event_table::TranslationTable;

    fn table(with_buf: bool) -> TranslationTable<HashMap<GroupAndName, String>> {
        let mut print = Event::new("ftrace", "print", 20);
        if with_buf {
            print.fields.push(Field {
                name: "buf".to_string(),
                ..Default::default()
            });
        }
        TranslationTable::new(HashMap::new(), vec![print], CompactSchedFormat::invalid())
    }

    fn prefix_rule(prefix: &str, allow: bool) -> PrintFilterRule {
        PrintFilterRule {
            prefix: Some(prefix.to_string()),
            atrace_msg: None,
            allow,
        }
    }

    #[test]
    fn test_requires_buf_field() {
        let filter = PrintFilter {
            rules: vec![prefix_rule("foo", false)],
        };
        assert!(FtracePrintFilterConfig::create(&filter, &table(false)).is_none());
        let config = FtracePrintFilterConfig::create(&filter, &table(true)).unwrap();
        assert_eq!(config.print_event_id(), 20);
    }

    #[test]
    fn test_first_match_wins() {
        let filter = PrintFilter {
            rules: vec![prefix_rule("Good ", true), prefix_rule("", false)],
        };
        let config = FtracePrintFilterConfig::create(&filter, &table(true)).unwrap();
        assert!(config.is_event_interesting("Good line"));
        assert!(!config.is_event_interesting("Bad line"));
    }

    #[test]
    fn test_default_allow() {
        let filter = PrintFilter {
            rules: vec![prefix_rule("Bad", false)],
        };
        let config = FtracePrintFilterConfig::create(&filter, &table(true)).unwrap();
        assert!(config.is_event_interesting("Good line"));
        assert!(!config.is_event_interesting("Bad line"));
    }

    #[test]
    fn test_atrace_message() {
        let filter = PrintFilter {
            rules: vec![PrintFilterRule {
                prefix: None,
                atrace_msg: Some(AtraceMessageMatch {
                    msg_type: "C".to_string(),
                    prefix: "queue".to_string(),
                }),
                allow: false,
            }],
        };
        let config = FtracePrintFilterConfig::create(&filter, &table(true)).unwrap();
        assert!(!config.is_event_interesting("C|1234|queue_depth|4"));
        assert!(config.is_event_interesting("B|1234|queue_depth"));
        assert!(config.is_event_interesting("C|abc|queue_depth|4"));
        assert!(config.is_event_interesting("queue_depth"));
    }
}
