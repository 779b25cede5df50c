/// Worker count used when the hardware parallelism cannot be detected.
pub const FALLBACK_WORKERS: usize = 4;

/// Number of hardware threads available to this process.
pub fn hardware_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(FALLBACK_WORKERS)
}
