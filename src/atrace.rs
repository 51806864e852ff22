//! Android userspace tracing through the `atrace` helper binary.

use std::process::{Command, Stdio};
use std::sync::OnceLock;

const ATRACE_PATH: &str = "/system/bin/atrace";

// --only_userspace landed in P.
const SDK_USERSPACE_ONLY: u32 = 28;
// --prefer_sdk landed in Android 16.
const SDK_PREFER_SDK: u32 = 36;

pub trait AtraceWrapper {
    /// Runs atrace with `args`, where `args[0]` is the program name. Anything
    /// atrace prints to stderr is appended to `errors`.
    fn run_atrace(&mut self, args: &[String], errors: Option<&mut String>) -> bool;
    fn supports_userspace_only(&self) -> bool;
    fn supports_prefer_sdk(&self) -> bool;
}

/// Runs the real atrace binary.
#[derive(Debug, Default)]
pub struct AtraceCommand {
    sdk_version: OnceLock<Option<u32>>,
}

impl AtraceCommand {
    pub fn new() -> Self {
        Self::default()
    }

    fn sdk_version(&self) -> Option<u32> {
        *self.sdk_version.get_or_init(read_sdk_version)
    }
}

fn read_sdk_version() -> Option<u32> {
    let output = Command::new("getprop")
        .arg("ro.build.version.sdk")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout).trim().parse().ok()
}

impl AtraceWrapper for AtraceCommand {
    fn run_atrace(&mut self, args: &[String], errors: Option<&mut String>) -> bool {
        tracing::debug!("Running {:?}", args);
        let output = match Command::new(ATRACE_PATH)
            .args(args.iter().skip(1))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!("Failed to run {}: {}", ATRACE_PATH, e);
                if let Some(errors) = errors {
                    errors.push_str(&format!("Failed to run {}: {}\n", ATRACE_PATH, e));
                }
                return false;
            }
        };

        if let Some(errors) = errors {
            errors.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        if !output.status.success() {
            tracing::warn!("atrace exited with {}", output.status);
            return false;
        }
        true
    }

    fn supports_userspace_only(&self) -> bool {
        self.sdk_version().is_some_and(|v| v >= SDK_USERSPACE_ONLY)
    }

    fn supports_prefer_sdk(&self) -> bool {
        self.sdk_version().is_some_and(|v| v >= SDK_PREFER_SDK)
    }
}
