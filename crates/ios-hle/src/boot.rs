//! Title boot and reload: memory layout constants, reload timing and the collaborators the host
//! needs to pause the guest CPU and load a companion program.

use std::io;
use std::path::{Path, PathBuf};

use ios_mem::GuestMemory;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::IpcTimings;

pub mod titles {
    /// The System Menu itself.
    pub const SYSTEM_MENU: u64 = 0x0000_0001_0000_0002;
    /// IOS58, the version the System Menu runs on by default.
    pub const SYSTEM_MENU_IOS: u64 = 0x0000_0001_0000_003A;
    /// Boot code for GameCube mode.
    pub const BC: u64 = 0x0000_0001_0000_0100;
    /// GameCube mode kernel. Registers no devices.
    pub const MIOS: u64 = 0x0000_0001_0000_0101;

    const SYSTEM_TITLE_TYPE: u32 = 0x0000_0001;

    pub const fn ios(version: u32) -> u64 {
        ((SYSTEM_TITLE_TYPE as u64) << 32) | version as u64
    }

    /// Low word of the title id; the IOS version number for IOS titles.
    pub const fn version(title_id: u64) -> u32 {
        title_id as u32
    }

    pub const fn is_ios(title_id: u64) -> bool {
        let low = title_id as u32;
        (title_id >> 32) as u32 == SYSTEM_TITLE_TYPE && low > 2 && low < 0x100
    }
}

pub const MEM1_SIZE: u32 = 0x0180_0000;
pub const MEM1_END: u32 = 0x8180_0000;
pub const MEM1_ARENA_BEGIN: u32 = 0x0000_0000;
pub const MEM1_ARENA_END: u32 = 0x8180_0000;
pub const MEM2_SIZE: u32 = 0x0400_0000;
pub const MEM2_ARENA_BEGIN: u32 = 0x9000_0800;
pub const HOLLYWOOD_REVISION: u32 = 0x0000_0011;
pub const RAM_VENDOR: u32 = 0x0000_FF01;
pub const RAM_VENDOR_MIOS: u32 = 0xCAFE_BABE;
pub const PLACEHOLDER: u32 = 0xDEAD_BEEF;

// Low-memory addresses the guest reads the layout from.
const ADDR_LEGACY_MEM_SIZE: u32 = 0x0028;
const ADDR_LEGACY_MEM_SIM_SIZE: u32 = 0x00F0;
const ADDR_MEM1_SIZE: u32 = 0x3100;
const ADDR_MEM1_SIM_SIZE: u32 = 0x3104;
const ADDR_MEM1_END: u32 = 0x3108;
const ADDR_MEM1_ARENA_BEGIN: u32 = 0x310C;
const ADDR_MEM1_ARENA_END: u32 = 0x3110;
const ADDR_PH1: u32 = 0x3114;
const ADDR_MEM2_SIZE: u32 = 0x3118;
const ADDR_MEM2_SIM_SIZE: u32 = 0x311C;
const ADDR_MEM2_END: u32 = 0x3120;
const ADDR_MEM2_ARENA_BEGIN: u32 = 0x3124;
const ADDR_MEM2_ARENA_END: u32 = 0x3128;
const ADDR_PH2: u32 = 0x312C;
const ADDR_IPC_BUFFER_BEGIN: u32 = 0x3130;
const ADDR_IPC_BUFFER_END: u32 = 0x3134;
const ADDR_HOLLYWOOD_REVISION: u32 = 0x3138;
const ADDR_PH3: u32 = 0x313C;
const ADDR_IOS_VERSION: u32 = 0x3140;
const ADDR_IOS_DATE: u32 = 0x3144;
const ADDR_IOS_RESERVED_BEGIN: u32 = 0x3148;
const ADDR_IOS_RESERVED_END: u32 = 0x314C;
const ADDR_PH4: u32 = 0x3150;
const ADDR_PH5: u32 = 0x3154;
const ADDR_RAM_VENDOR: u32 = 0x3158;
const ADDR_BOOT_FLAG: u32 = 0x315C;
const ADDR_APPLOADER_FLAG: u32 = 0x315D;
const ADDR_DEVKIT_BOOT_PROGRAM_VERSION: u32 = 0x315E;
const ADDR_SYSMENU_SYNC: u32 = 0x3160;

/// Memory layout an IOS version advertises to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryValues {
    pub ios_number: u16,
    pub ios_revision: u16,
    pub ios_date: u32,
    pub mem1_physical_size: u32,
    pub mem1_simulated_size: u32,
    pub mem1_end: u32,
    pub mem1_arena_begin: u32,
    pub mem1_arena_end: u32,
    pub mem2_physical_size: u32,
    pub mem2_simulated_size: u32,
    pub mem2_end: u32,
    pub mem2_arena_begin: u32,
    pub mem2_arena_end: u32,
    pub ipc_buffer_begin: u32,
    pub ipc_buffer_end: u32,
    pub hollywood_revision: u32,
    pub ram_vendor: u32,
    pub ios_reserved_begin: u32,
    pub ios_reserved_end: u32,
    pub sysmenu_sync: u32,
}

const fn layout(ios_number: u16, ios_revision: u16, ios_date: u32, high: bool) -> MemoryValues {
    // Older kernels reserve the top 10 MiB of MEM2, newer ones 12 MiB.
    let (mem2_end, ipc_begin, reserved_end) = if high {
        (0x9360_0000, 0x935E_0000, 0x9362_0000)
    } else {
        (0x9340_0000, 0x933E_0000, 0x9342_0000)
    };
    MemoryValues {
        ios_number,
        ios_revision,
        ios_date,
        mem1_physical_size: MEM1_SIZE,
        mem1_simulated_size: MEM1_SIZE,
        mem1_end: MEM1_END,
        mem1_arena_begin: MEM1_ARENA_BEGIN,
        mem1_arena_end: MEM1_ARENA_END,
        mem2_physical_size: MEM2_SIZE,
        mem2_simulated_size: MEM2_SIZE,
        mem2_end,
        mem2_arena_begin: MEM2_ARENA_BEGIN,
        mem2_arena_end: ipc_begin,
        ipc_buffer_begin: ipc_begin,
        ipc_buffer_end: mem2_end,
        hollywood_revision: HOLLYWOOD_REVISION,
        ram_vendor: RAM_VENDOR,
        ios_reserved_begin: mem2_end,
        ios_reserved_end: reserved_end,
        sysmenu_sync: 0,
    }
}

const MEMORY_VALUES: &[MemoryValues] = &[
    layout(9, 0x020E, 0x0311_0510, true),
    layout(12, 0x020E, 0x0312_0806, true),
    layout(28, 0x070F, 0x0608_0822, true),
    layout(30, 0x0A10, 0x0503_2109, true),
    layout(36, 0x0E1A, 0x0610_1008, true),
    layout(53, 0x1406, 0x0311_2009, false),
    layout(55, 0x1406, 0x0311_2009, false),
    layout(56, 0x161F, 0x0201_2011, false),
    layout(57, 0x1820, 0x0209_2011, false),
    layout(58, 0x1820, 0x0310_2011, false),
    layout(61, 0x1406, 0x0311_2009, false),
    layout(70, 0x1B00, 0x0604_2010, false),
    layout(80, 0x1B20, 0x0317_2012, false),
    MemoryValues {
        ram_vendor: RAM_VENDOR_MIOS,
        ..layout(0x101, 0x000A, 0x0803_2010, false)
    },
];

pub fn memory_values(version: u32) -> Option<&'static MemoryValues> {
    MEMORY_VALUES
        .iter()
        .find(|v| u32::from(v.ios_number) == version)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySetupType {
    /// Cold boot: also writes the legacy size words.
    Full,
    /// Reload from a running IOS.
    IosReload,
}

/// Write the layout constants for `title_id` into low memory.
///
/// Returns `false` without touching memory when the version has no known layout; such images
/// are expected to configure memory themselves.
pub fn setup_memory(memory: &mut dyn GuestMemory, title_id: u64, setup: MemorySetupType) -> bool {
    let version = titles::version(title_id);
    let Some(v) = memory_values(version) else {
        warn!(title_id, version, "no memory layout for this IOS version, skipping setup");
        return false;
    };

    if setup == MemorySetupType::Full {
        memory.write_u32(ADDR_LEGACY_MEM_SIZE, v.mem1_physical_size);
        memory.write_u32(ADDR_LEGACY_MEM_SIM_SIZE, v.mem1_simulated_size);
    }

    memory.write_u32(ADDR_MEM1_SIZE, v.mem1_physical_size);
    memory.write_u32(ADDR_MEM1_SIM_SIZE, v.mem1_simulated_size);
    memory.write_u32(ADDR_MEM1_END, v.mem1_end);
    memory.write_u32(ADDR_MEM1_ARENA_BEGIN, v.mem1_arena_begin);
    memory.write_u32(ADDR_MEM1_ARENA_END, v.mem1_arena_end);
    memory.write_u32(ADDR_PH1, PLACEHOLDER);
    memory.write_u32(ADDR_MEM2_SIZE, v.mem2_physical_size);
    memory.write_u32(ADDR_MEM2_SIM_SIZE, v.mem2_simulated_size);
    memory.write_u32(ADDR_MEM2_END, v.mem2_end);
    memory.write_u32(ADDR_MEM2_ARENA_BEGIN, v.mem2_arena_begin);
    memory.write_u32(ADDR_MEM2_ARENA_END, v.mem2_arena_end);
    memory.write_u32(ADDR_PH2, PLACEHOLDER);
    memory.write_u32(ADDR_IPC_BUFFER_BEGIN, v.ipc_buffer_begin);
    memory.write_u32(ADDR_IPC_BUFFER_END, v.ipc_buffer_end);
    memory.write_u32(ADDR_HOLLYWOOD_REVISION, v.hollywood_revision);
    memory.write_u32(ADDR_PH3, PLACEHOLDER);
    memory.write_u16(ADDR_IOS_VERSION, v.ios_number);
    memory.write_u16(ADDR_IOS_VERSION + 2, v.ios_revision);
    memory.write_u32(ADDR_IOS_DATE, v.ios_date);
    memory.write_u32(ADDR_IOS_RESERVED_BEGIN, v.ios_reserved_begin);
    memory.write_u32(ADDR_IOS_RESERVED_END, v.ios_reserved_end);
    memory.write_u32(ADDR_PH4, PLACEHOLDER);
    memory.write_u32(ADDR_PH5, PLACEHOLDER);
    memory.write_u32(ADDR_RAM_VENDOR, v.ram_vendor);
    memory.write_u8(ADDR_BOOT_FLAG, 0);
    memory.write_u8(ADDR_APPLOADER_FLAG, 0);
    memory.write_u16(ADDR_DEVKIT_BOOT_PROGRAM_VERSION, 0);
    memory.write_u32(ADDR_SYSMENU_SYNC, v.sysmenu_sync);

    info!(title_id, version, ?setup, "memory layout established");
    true
}

/// Simulated reload latency for booting into `title_id`.
///
/// Versions before 28 ship as one monolithic image and take far longer to bring up.
pub fn boot_ticks(title_id: u64, timings: &IpcTimings) -> u64 {
    if titles::version(title_id) < 28 {
        timings.legacy_boot_ticks
    } else {
        timings.modern_boot_ticks
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootState {
    Uninitialized,
    MemoryLayoutEstablished,
    Running,
    /// IPC is paused until the new kernel instance exists.
    SwapRequested,
}

impl BootState {
    /// Whether the state machine may move from `self` to `next`.
    ///
    /// A swap re-establishes the memory layout before the new kernel runs. Repeating a reload
    /// request while one is pending is allowed.
    pub fn can_advance_to(self, next: BootState) -> bool {
        use BootState::*;
        matches!(
            (self, next),
            (Uninitialized, MemoryLayoutEstablished)
                | (MemoryLayoutEstablished, Running)
                | (Running, SwapRequested)
                | (SwapRequested, SwapRequested)
                | (SwapRequested, MemoryLayoutEstablished)
        )
    }
}

/// A request to reload into another title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootRequest {
    pub title_id: u64,
    /// Reset and hold the guest CPU until the reload completes.
    pub hang_cpu: bool,
    /// Program image loaded into guest memory for the new kernel to hand control to.
    pub companion: Option<PathBuf>,
    /// Command block the new kernel acknowledges once it is up.
    pub acknowledge: Option<u32>,
}

impl BootRequest {
    pub fn new(title_id: u64) -> Self {
        Self {
            title_id,
            hang_cpu: false,
            companion: None,
            acknowledge: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum BootError {
    #[error("failed to load companion program {path}: {source}")]
    Companion {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The guest CPU as seen by the reload state machine.
pub trait GuestCpu {
    fn is_running(&self) -> bool;

    /// Stop the CPU and reset it so it cannot observe a half-swapped kernel.
    fn reset_and_pause(&mut self);

    /// Resume execution at `entry`.
    fn release(&mut self, entry: u32);
}

/// CPU stand-in for hosts that drive the guest themselves.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeadlessCpu {
    pub running: bool,
    pub pc: u32,
}

impl HeadlessCpu {
    pub fn running() -> Self {
        Self {
            running: true,
            pc: 0,
        }
    }
}

impl GuestCpu for HeadlessCpu {
    fn is_running(&self) -> bool {
        self.running
    }

    fn reset_and_pause(&mut self) {
        self.running = false;
        self.pc = 0;
    }

    fn release(&mut self, entry: u32) {
        self.pc = entry;
        self.running = true;
    }
}

/// Loads program images into guest memory.
pub trait ProgramLoader {
    /// Load the image at `path` and return its entry point.
    fn load(&mut self, memory: &mut dyn GuestMemory, path: &Path) -> io::Result<u32>;
}

/// Loader for hosts without program images. Every load fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgramLoader;

impl ProgramLoader for NoProgramLoader {
    fn load(&mut self, _memory: &mut dyn GuestMemory, path: &Path) -> io::Result<u32> {
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no program loader available for {}", path.display()),
        ))
    }
}
