//! Ambient VM configuration, in the spirit of a plain `serde`-deserializable
//! struct of named constants rather than a full config-watching service.

#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde-types", serde(default))]
#[derive(Debug, Clone, PartialEq)]
pub struct VmConfig {
    /// Maximum number of nested call frames before a stack-overflow error.
    pub frames_max: usize,
    /// Registers reserved per call frame by default when a Proto's own
    /// `max_stack` estimate is unavailable (used only for the top-level
    /// script frame's sizing before its Proto is known).
    pub stack_per_frame: usize,
    /// When set, the VM logs a per-instruction trace at `log::Level::Trace`.
    pub trace_execution: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            frames_max: 64,
            stack_per_frame: 256,
            trace_execution: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = VmConfig::default();
        assert_eq!(cfg.frames_max, 64);
        assert_eq!(cfg.stack_per_frame, 256);
        assert!(!cfg.trace_execution);
    }
}
