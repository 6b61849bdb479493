//! Line protocol spoken by the diagnostic workers.
//!
//! The batch script and every worker write to one captured stream:
//!
//! ```text
//! hosts <host1> <host2> ...
//! result <host> <local_index> <value> [<elapsed_secs>]
//! gpu_error <host> <local_index> [...]
//! ```
//!
//! Anything else (scheduler chatter, NCCL logs, tracebacks) is ignored.

use std::collections::BTreeMap;

use serde::Serialize;

const HOSTS_TAG: &str = "hosts";
const RESULT_TAG: &str = "result";
const GPU_ERROR_TAG: &str = "gpu_error";

/// One accelerator on one host.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct AcceleratorSlot {
    pub host: String,
    pub index: u32,
}

impl AcceleratorSlot {
    #[must_use]
    pub fn new(host: impl Into<String>, index: u32) -> Self {
        Self {
            host: host.into(),
            index,
        }
    }
}

impl std::fmt::Display for AcceleratorSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.host, self.index)
    }
}

/// What a worker reported for its slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResultRecord {
    /// The diagnostic ran to completion.
    Success {
        value: f64,
        /// Wall time of the measured section. Older probe workers do not print it.
        elapsed: Option<f64>,
    },
    /// The worker could not bring up or use the device.
    AcceleratorError,
}

/// Structured view of one run's captured output.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedOutput {
    /// Hosts of the allocation, from the first `hosts` line.
    pub hosts: Option<Vec<String>>,
    /// Latest record per slot.
    pub records: BTreeMap<AcceleratorSlot, ResultRecord>,
    /// Number of well-formed `result` lines, duplicates included.
    pub result_lines: usize,
    /// Number of well-formed `gpu_error` lines, duplicates included.
    pub error_lines: usize,
}

/// Parse captured output. Pure: the same text always gives the same records.
#[must_use]
pub fn parse(text: &str) -> ParsedOutput {
    let mut parsed = ParsedOutput::default();

    for line in text.lines() {
        let mut tokens = line.split_whitespace();
        match tokens.next() {
            Some(HOSTS_TAG) => {
                if parsed.hosts.is_none() {
                    parsed.hosts = Some(tokens.map(String::from).collect());
                }
            }
            Some(RESULT_TAG) => {
                if let Some((slot, record)) = parse_result(tokens) {
                    parsed.result_lines += 1;
                    parsed.records.insert(slot, record);
                }
            }
            Some(GPU_ERROR_TAG) => {
                if let Some(slot) = parse_slot(&mut tokens) {
                    parsed.error_lines += 1;
                    parsed.records.insert(slot, ResultRecord::AcceleratorError);
                }
            }
            _ => {}
        }
    }

    parsed
}

fn parse_slot<'a>(tokens: &mut impl Iterator<Item = &'a str>) -> Option<AcceleratorSlot> {
    let host = tokens.next()?;
    let index = tokens.next()?.parse().ok()?;
    Some(AcceleratorSlot::new(host, index))
}

fn parse_result<'a>(
    mut tokens: impl Iterator<Item = &'a str>,
) -> Option<(AcceleratorSlot, ResultRecord)> {
    let slot = parse_slot(&mut tokens)?;
    let value: f64 = tokens.next()?.parse().ok()?;
    let elapsed = match tokens.next() {
        Some(tok) => Some(tok.parse::<f64>().ok()?),
        None => None,
    };
    Some((slot, ResultRecord::Success { value, elapsed }))
}

/// Every slot of the allocation, host-major.
#[must_use]
pub fn slots(hosts: &[String], gpu_per_node: u32) -> Vec<AcceleratorSlot> {
    hosts
        .iter()
        .flat_map(|host| (0..gpu_per_node).map(move |index| AcceleratorSlot::new(host, index)))
        .collect()
}
