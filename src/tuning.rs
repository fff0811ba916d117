//! JVM memory tuning
//!
//! Derives the broker's heap flags from the heap size given on the command line
//! and checks the request against the memory actually installed.

use sysinfo::System;

/// Heap layout derived from the requested heap size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapOptions {
    /// Maximum heap (-Xmx) in MB
    pub max_mb: u64,
    /// Initial heap (-Xms) in MB, half the maximum
    pub min_mb: u64,
    /// Young generation (-XX:NewSize / -XX:MaxNewSize) in MB, a third of the maximum
    pub new_gen_mb: u64,
}

impl HeapOptions {
    /// Derive the layout for a heap of `heap_mb` megabytes
    pub fn new(heap_mb: u64) -> Self {
        Self {
            max_mb: heap_mb,
            min_mb: heap_mb / 2,
            new_gen_mb: heap_mb / 3,
        }
    }

    /// Value for KAFKA_HEAP_OPTS
    pub fn kafka_heap_opts(&self) -> String {
        format!(
            "-XX:+UseConcMarkSweepGC -XX:+CMSIncrementalMode -Xmx{}m -Xms{}m \
             -XX:NewSize={}m -XX:MaxNewSize={}m -Xss256k -XX:+UseTLAB -XX:+AlwaysPreTouch",
            self.max_mb, self.min_mb, self.new_gen_mb, self.new_gen_mb
        )
    }
}

/// Value for KAFKA_JVM_PERFORMANCE_OPTS
pub const JVM_PERFORMANCE_OPTS: &str = "-server -XX:+UseCompressedOops -XX:+CMSClassUnloadingEnabled \
     -XX:+CMSScavengeBeforeRemark -XX:+DisableExplicitGC";

/// Detect total RAM in megabytes
pub fn detect_ram_mb() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.total_memory() / 1024 / 1024
}

/// Warn when the requested heap cannot fit in physical memory
pub fn check_heap(heap: &HeapOptions) -> bool {
    let ram_mb = detect_ram_mb();
    let fits = ram_mb == 0 || heap.max_mb <= ram_mb;

    if fits {
        tracing::info!(
            heap_mb = heap.max_mb,
            min_mb = heap.min_mb,
            new_gen_mb = heap.new_gen_mb,
            ram_mb,
            "Derived broker heap layout"
        );
    } else {
        tracing::warn!(
            heap_mb = heap.max_mb,
            ram_mb,
            "Requested heap is larger than physical memory; the broker will likely swap or fail"
        );
    }

    fits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_layout() {
        let heap = HeapOptions::new(3000);
        assert_eq!(heap.max_mb, 3000);
        assert_eq!(heap.min_mb, 1500);
        assert_eq!(heap.new_gen_mb, 1000);

        // Integer division like the JVM flags expect
        let heap = HeapOptions::new(1001);
        assert_eq!(heap.min_mb, 500);
        assert_eq!(heap.new_gen_mb, 333);
    }

    #[test]
    fn test_heap_opts_string() {
        let opts = HeapOptions::new(1024).kafka_heap_opts();
        assert!(opts.contains("-Xmx1024m"));
        assert!(opts.contains("-Xms512m"));
        assert!(opts.contains("-XX:NewSize=341m"));
        assert!(opts.contains("-XX:MaxNewSize=341m"));
        assert!(opts.contains("-Xss256k"));
        assert!(!opts.contains("  "));
    }

    #[test]
    fn test_small_heap_fits() {
        assert!(check_heap(&HeapOptions::new(1)));
    }
}
