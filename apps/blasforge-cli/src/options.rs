//! Command-line options.

pub const USAGE: &str = "\
Usage: blasforge [OPTIONS]

Builds a batch of procedural box BLASes, then compacts them.

Options:
  --items <N>          Number of acceleration structures [default: 16]
  --boxes <N>          Boxes in the smallest structure [default: 64]
  --budget <BYTES>     Scratch budget per sub-batch [default: 4x peak scratch]
  --compact-every <N>  Request compaction for every Nth item, 0 for none [default: 1]
  --no-compact         Finish the batch without a compaction pass
  --gpu                Build on the GPU instead of the simulated device
  --validation         Enable Vulkan validation layers
  -h, --help           Print this help";

/// Parsed command-line options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    pub items: usize,
    pub boxes: u32,
    /// `None` picks a budget from the plan.
    pub budget: Option<u64>,
    pub compact_every: usize,
    pub compact: bool,
    pub gpu: bool,
    pub validation: bool,
    pub help: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            items: 16,
            boxes: 64,
            budget: None,
            compact_every: 1,
            compact: true,
            gpu: false,
            validation: false,
            help: false,
        }
    }
}

impl Options {
    /// Parse options from the process arguments.
    pub fn from_args() -> Self {
        Self::parse(std::env::args().skip(1))
    }

    /// Parse options, ignoring unknown flags and unparsable values.
    pub fn parse(args: impl IntoIterator<Item = String>) -> Self {
        let mut options = Self::default();
        let args: Vec<String> = args.into_iter().collect();

        let mut i = 0;
        while i < args.len() {
            let value = args.get(i + 1);
            match args[i].as_str() {
                "--items" => {
                    if let Some(v) = value.and_then(|v| v.parse().ok()) {
                        options.items = v;
                        i += 1;
                    }
                }
                "--boxes" => {
                    if let Some(v) = value.and_then(|v| v.parse().ok()) {
                        options.boxes = v;
                        i += 1;
                    }
                }
                "--budget" => {
                    if let Some(v) = value.and_then(|v| v.parse().ok()) {
                        options.budget = Some(v);
                        i += 1;
                    }
                }
                "--compact-every" => {
                    if let Some(v) = value.and_then(|v| v.parse().ok()) {
                        options.compact_every = v;
                        i += 1;
                    }
                }
                "--no-compact" => options.compact = false,
                "--gpu" => options.gpu = true,
                "--validation" => options.validation = true,
                "-h" | "--help" => options.help = true,
                other => tracing::warn!("Ignoring unknown argument {other}"),
            }
            i += 1;
        }

        options
    }

    /// Whether item `index` asks for compaction.
    pub fn wants_compaction(&self, index: usize) -> bool {
        self.compact_every != 0 && index % self.compact_every == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Options {
        Options::parse(args.iter().map(ToString::to_string))
    }

    #[test]
    fn defaults() {
        let options = parse(&[]);
        assert_eq!(options, Options::default());
        assert!(options.compact);
        assert!(!options.gpu);
    }

    #[test]
    fn values_and_switches() {
        let options = parse(&[
            "--items", "3", "--boxes", "10", "--budget", "4096", "--no-compact", "--gpu",
        ]);
        assert_eq!(options.items, 3);
        assert_eq!(options.boxes, 10);
        assert_eq!(options.budget, Some(4096));
        assert!(!options.compact);
        assert!(options.gpu);
        assert!(!options.validation);
    }

    #[test]
    fn bad_value_is_skipped() {
        let options = parse(&["--items", "many", "--validation"]);
        assert_eq!(options.items, 16);
        assert!(options.validation);
    }

    #[test]
    fn compaction_selection() {
        let options = parse(&["--compact-every", "3"]);
        let selected: Vec<_> = (0..7).filter(|&i| options.wants_compaction(i)).collect();
        assert_eq!(selected, vec![0, 3, 6]);

        let none = parse(&["--compact-every", "0"]);
        assert!(!(0..7).any(|i| none.wants_compaction(i)));
    }

    #[test]
    fn help() {
        assert!(parse(&["-h"]).help);
        assert!(parse(&["--help"]).help);
    }
}
