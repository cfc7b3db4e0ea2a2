use clap::ValueEnum;

/// Compute target passed through to the segmentation model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum Device {
    #[default]
    Cuda,
    Cpu,
    Mps,
}

impl Device {
    pub fn as_str(&self) -> &'static str {
        match self {
            Device::Cuda => "cuda",
            Device::Cpu => "cpu",
            Device::Mps => "mps",
        }
    }
}

/// Which background-adjacent label pairs are kept in the overlap table.
///
/// The pure-background pair (0, 0) is never reported. Whether
/// foreground-vs-background pairs survive is configurable; by default they
/// are retained.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BackgroundPolicy {
    /// Drop only the pure-background pair (0, 0).
    #[default]
    ExcludePureBackground,
    /// Drop every pair where either label is 0.
    ForegroundPairsOnly,
}
