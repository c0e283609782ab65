//! Handles and descriptors exchanged with the driver

use std::fmt;

/// Handle to a command stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(pub u64);

impl StreamHandle {
    /// Create a new stream handle
    pub const fn new(id: u64) -> Self {
        StreamHandle(id)
    }

    /// Get the internal ID
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream{}", self.0)
    }
}

/// Handle to a device event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(pub u64);

impl EventHandle {
    /// Create a new event handle
    pub const fn new(id: u64) -> Self {
        EventHandle(id)
    }

    /// Get the internal ID
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event{}", self.0)
    }
}

/// Where a piece of memory lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemPlacement {
    /// Device-local memory
    Device,
    /// Host memory visible to the device
    Host,
}

/// Direction tag of a copy; drivers validate it against the real placement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyKind {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
    HostToHost,
}

impl CopyKind {
    /// Derive the copy kind from source and destination placements
    pub const fn between(src: MemPlacement, dst: MemPlacement) -> Self {
        match (src, dst) {
            (MemPlacement::Host, MemPlacement::Device) => CopyKind::HostToDevice,
            (MemPlacement::Device, MemPlacement::Host) => CopyKind::DeviceToHost,
            (MemPlacement::Device, MemPlacement::Device) => CopyKind::DeviceToDevice,
            (MemPlacement::Host, MemPlacement::Host) => CopyKind::HostToHost,
        }
    }

    /// Placement the source must have
    pub const fn src_placement(self) -> MemPlacement {
        match self {
            CopyKind::HostToDevice | CopyKind::HostToHost => MemPlacement::Host,
            CopyKind::DeviceToHost | CopyKind::DeviceToDevice => MemPlacement::Device,
        }
    }

    /// Placement the destination must have
    pub const fn dst_placement(self) -> MemPlacement {
        match self {
            CopyKind::HostToDevice | CopyKind::DeviceToDevice => MemPlacement::Device,
            CopyKind::DeviceToHost | CopyKind::HostToHost => MemPlacement::Host,
        }
    }

    /// Short label used in transfer logs
    pub const fn label(self) -> &'static str {
        match self {
            CopyKind::HostToDevice => "H2D",
            CopyKind::DeviceToHost => "D2H",
            CopyKind::DeviceToDevice => "D2D",
            CopyKind::HostToHost => "H2H",
        }
    }
}

/// One address-to-address copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyDesc {
    pub dst: u64,
    pub src: u64,
    pub len: usize,
    pub kind: CopyKind,
}

impl CopyDesc {
    pub const fn new(dst: u64, src: u64, len: usize, kind: CopyKind) -> Self {
        Self { dst, src, len, kind }
    }
}

/// Work item bound onto a stream at distribution time.
///
/// Argument values are not embedded: kernels and indirect copies read them
/// from the device argument table at `args_addr` when they execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOp {
    /// Kernel reading `argc` u64 arguments from `args_addr`
    Kernel { name: String, args_addr: u64, argc: usize },
    /// Copy whose `[src, dst, len]` triple lives at `args_addr`
    IndirectCopy { args_addr: u64 },
    /// Record an event
    RecordEvent(EventHandle),
    /// Wait for an event recorded earlier in the same launch
    WaitEvent(EventHandle),
}

/// Completion status reported by the device after synchronization.
///
/// Codes other than [`DeviceStatus::SUCCESS`] are either non-fatal signals
/// (end of sequence, normal model abort) or faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceStatus(pub u32);

impl DeviceStatus {
    pub const SUCCESS: DeviceStatus = DeviceStatus(0);
    /// Input pipeline reached the end of its data
    pub const END_OF_SEQUENCE: DeviceStatus = DeviceStatus(507_005);
    /// Kernel-side fault
    pub const KERNEL_FAULT: DeviceStatus = DeviceStatus(507_011);
    /// Model aborted on user request
    pub const MODEL_ABORT_NORMAL: DeviceStatus = DeviceStatus(507_024);

    pub const fn code(self) -> u32 {
        self.0
    }

    pub const fn is_success(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "status({})", self.0)
    }
}
