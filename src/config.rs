//! Pipeline configuration.

/// What to do when a lookup fails for a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop the whole stream on the first failed lookup.
    #[default]
    Abort,
    /// Log the failure, record the sentinel for that lookup and continue.
    Degrade,
}

/// What to emit for a line removed by an exclusion marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExcludedLineOutput {
    /// Emit nothing.
    #[default]
    Omit,
    /// Emit an empty record so output lines stay aligned with input lines.
    Blank,
}

/// Annotation pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Lines containing any of these substrings are excluded (case-sensitive)
    pub exclusion_markers: Vec<String>,

    /// Output for excluded lines
    pub excluded_output: ExcludedLineOutput,

    /// Lookup failure handling
    pub failure_policy: FailurePolicy,

    /// Value recorded when no result is available
    pub sentinel: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            exclusion_markers: vec!["spider".to_string(), "bot".to_string(), "crawl".to_string()],
            excluded_output: ExcludedLineOutput::Omit,
            failure_policy: FailurePolicy::Abort,
            sentinel: "absent".to_string(),
        }
    }
}

impl PipelineConfig {
    /// True when `line` carries one of the exclusion markers.
    pub fn is_excluded(&self, line: &str) -> bool {
        self.exclusion_markers
            .iter()
            .any(|marker| !marker.is_empty() && line.contains(marker.as_str()))
    }
}
