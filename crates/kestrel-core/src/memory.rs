//! Allocation-tag accounting.
//!
//! Every engine allocation is attributed to a [`MemoryTag`]. A [`MemoryTracker`]
//! keeps live allocation counts and byte totals per tag so shutdown can verify
//! that nothing leaked.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Category an allocation is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemoryTag {
    /// Growable array storage not otherwise categorised.
    Array,
    /// Renderer-owned host allocations.
    Renderer,
    /// Scene graph storage.
    Scene,
    /// GPU buffers.
    GpuBuffer,
    /// GPU images.
    GpuImage,
    /// Descriptor pools.
    DescriptorPool,
    /// Command pools.
    CommandPool,
    /// Fences and semaphores.
    SyncObject,
    /// Per-frame staging memory.
    Staging,
}

impl MemoryTag {
    /// Number of tags.
    pub const COUNT: usize = 9;

    /// All tags in declaration order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Array,
        Self::Renderer,
        Self::Scene,
        Self::GpuBuffer,
        Self::GpuImage,
        Self::DescriptorPool,
        Self::CommandPool,
        Self::SyncObject,
        Self::Staging,
    ];

    /// Tags that track GPU-side resources.
    pub const GPU: [Self; 6] = [
        Self::GpuBuffer,
        Self::GpuImage,
        Self::DescriptorPool,
        Self::CommandPool,
        Self::SyncObject,
        Self::Staging,
    ];

    /// Human-readable tag name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Array => "array",
            Self::Renderer => "renderer",
            Self::Scene => "scene",
            Self::GpuBuffer => "gpu_buffer",
            Self::GpuImage => "gpu_image",
            Self::DescriptorPool => "descriptor_pool",
            Self::CommandPool => "command_pool",
            Self::SyncObject => "sync_object",
            Self::Staging => "staging",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for MemoryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Live usage of a single tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagUsage {
    /// Number of live allocations.
    pub allocations: u64,
    /// Live bytes.
    pub bytes: u64,
}

#[allow(clippy::declare_interior_mutable_const)]
const ZERO: AtomicU64 = AtomicU64::new(0);

/// Per-tag allocation accounting.
pub struct MemoryTracker {
    allocations: [AtomicU64; MemoryTag::COUNT],
    bytes: [AtomicU64; MemoryTag::COUNT],
}

static GLOBAL: MemoryTracker = MemoryTracker::new();

impl MemoryTracker {
    /// Create an empty tracker.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocations: [ZERO; MemoryTag::COUNT],
            bytes: [ZERO; MemoryTag::COUNT],
        }
    }

    /// Process-wide tracker used by host containers.
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Record a new allocation of `bytes` under `tag`.
    pub fn record_alloc(&self, tag: MemoryTag, bytes: u64) {
        self.allocations[tag.index()].fetch_add(1, Ordering::Relaxed);
        self.bytes[tag.index()].fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record the release of an allocation of `bytes` under `tag`.
    ///
    /// Releasing more than was recorded is a double-free pattern and panics.
    pub fn record_free(&self, tag: MemoryTag, bytes: u64) {
        let ok = self.allocations[tag.index()]
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1))
            .is_ok()
            && self.bytes[tag.index()]
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(bytes))
                .is_ok();

        if !ok {
            tracing::error!(tag = %tag, bytes, "release of untracked allocation");
            panic!("memory tracker underflow for tag `{tag}` ({bytes} bytes)");
        }
    }

    /// Record a resize of an existing allocation.
    pub fn record_realloc(&self, tag: MemoryTag, old_bytes: u64, new_bytes: u64) {
        if new_bytes >= old_bytes {
            self.bytes[tag.index()].fetch_add(new_bytes - old_bytes, Ordering::Relaxed);
        } else {
            self.bytes[tag.index()].fetch_sub(old_bytes - new_bytes, Ordering::Relaxed);
        }
    }

    /// Current usage of `tag`.
    pub fn usage(&self, tag: MemoryTag) -> TagUsage {
        TagUsage {
            allocations: self.allocations[tag.index()].load(Ordering::Relaxed),
            bytes: self.bytes[tag.index()].load(Ordering::Relaxed),
        }
    }

    /// Check that every tag in `tags` has no live allocation.
    pub fn is_clear(&self, tags: &[MemoryTag]) -> bool {
        tags.iter().all(|&tag| self.usage(tag).allocations == 0)
    }

    /// Usage of every tag with a live allocation.
    pub fn report(&self) -> Vec<(MemoryTag, TagUsage)> {
        MemoryTag::ALL
            .iter()
            .map(|&tag| (tag, self.usage(tag)))
            .filter(|(_, usage)| usage.allocations > 0)
            .collect()
    }

    /// Log every tag with live allocations at warn level.
    ///
    /// Returns `true` when nothing was left.
    pub fn log_leaks(&self, tags: &[MemoryTag]) -> bool {
        let mut clear = true;
        for &tag in tags {
            let usage = self.usage(tag);
            if usage.allocations > 0 {
                clear = false;
                tracing::warn!(
                    tag = %tag,
                    allocations = usage.allocations,
                    bytes = usage.bytes,
                    "leaked tagged allocations"
                );
            }
        }
        clear
    }
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for tag in MemoryTag::ALL {
            map.entry(&tag.name(), &self.usage(tag));
        }
        map.finish()
    }
}
