mod common;

use std::io;
use std::path::Path;

use common::Guest;
use ios_hle::boot::{titles, HeadlessCpu};
use ios_hle::device::es;
use ios_hle::fs::MemoryNand;
use ios_hle::ipc::IPC_SUCCESS;
use ios_hle::{BootError, BootState, Ios, IosConfig, ProgramLoader};
use ios_mem::{GuestMemory, GuestRam};
use pretty_assertions::assert_eq;

const IOS_VERSION_ADDR: u32 = 0x3140;

struct FixedEntryLoader(u32);

impl ProgramLoader for FixedEntryLoader {
    fn load(&mut self, _memory: &mut dyn GuestMemory, _path: &Path) -> io::Result<u32> {
        Ok(self.0)
    }
}

fn launch(g: &mut Guest, title_id: u64) -> u32 {
    let es_fd = g.open("/dev/es") as u32;
    let title = g.alloc_bytes(&title_id.to_be_bytes());
    g.submit_ioctlv(es_fd, es::IOCTLV_LAUNCH, &[(title, 8)], &[])
}

#[test]
fn startup_lays_out_memory_for_the_default_title() {
    let mut g = Guest::new();
    assert_eq!(g.ios.boot_state(), BootState::Running);
    assert_eq!(g.mem().read_u16(IOS_VERSION_ADDR), 58);
}

#[test]
fn es_launch_pauses_ipc_and_swaps_the_kernel() {
    let mut g = Guest::new();
    let block = launch(&mut g, titles::ios(36));
    let dispatch = g.ios.now() + g.ios.config().timings.ack_delay;

    g.ios.run_until(dispatch);
    assert_eq!(g.ios.boot_state(), BootState::SwapRequested);
    assert!(g.ios.kernel().is_paused());
    assert_eq!(g.ios.kernel().title_id(), titles::SYSTEM_MENU_IOS);

    g.settle();
    assert_eq!(g.ios.boot_state(), BootState::Running);
    assert_eq!(g.ios.kernel().title_id(), titles::ios(36));
    assert!(!g.ios.kernel().is_paused());
    assert_eq!(g.ios.kernel().fds().open_count(), 0);
    assert_eq!(g.mem().read_u16(IOS_VERSION_ADDR), 36);

    // Acknowledged once on dispatch and once by the new kernel, never answered.
    assert_eq!(g.acks().iter().filter(|a| **a == block).count(), 2);
    assert_eq!(g.result(block), None);
}

#[test]
fn reload_takes_the_configured_boot_latency() {
    let mut g = Guest::new();
    launch(&mut g, titles::ios(58));
    let dispatch = g.ios.now() + g.ios.config().timings.ack_delay;
    let done = dispatch + g.ios.config().timings.modern_boot_ticks;

    g.ios.run_until(done - 1);
    assert_eq!(g.ios.boot_state(), BootState::SwapRequested);
    g.ios.run_until(done);
    assert_eq!(g.ios.boot_state(), BootState::Running);
}

#[test]
fn launching_gamecube_mode_leaves_no_devices() {
    let mut g = Guest::new();
    let block = launch(&mut g, titles::BC);
    g.settle();
    assert!(g.ios.kernel().is_mios());
    assert!(g.ios.kernel().registry().is_empty());
    assert_eq!(g.acks().iter().filter(|a| **a == block).count(), 1);
}

#[test]
fn launching_a_non_ios_title_is_refused() {
    let mut g = Guest::new();
    let es_fd = g.open("/dev/es") as u32;
    let title = g.alloc_bytes(&0x0001_0000_5241_4245u64.to_be_bytes());
    let rv = g.call(|g| g.submit_ioctlv(es_fd, es::IOCTLV_LAUNCH, &[(title, 8)], &[]));
    assert_eq!(rv, ios_hle::ipc::ES_UNKNOWN_TITLE);
    assert_eq!(g.ios.boot_state(), BootState::Running);
}

#[test]
fn stopped_cpu_swaps_synchronously() {
    let mut ios = Ios::with_parts(
        IosConfig::default(),
        Box::new(GuestRam::new()),
        Box::new(HeadlessCpu::default()),
        Box::new(FixedEntryLoader(0)),
        MemoryNand::new().into_shared(),
    );
    ios.boot(titles::ios(36), false, None).unwrap();
    assert_eq!(ios.boot_state(), BootState::Running);
    assert_eq!(ios.kernel().title_id(), titles::ios(36));
    assert!(ios.events().is_empty());
}

#[test]
fn companion_program_receives_control_after_reload() {
    let mut ios = Ios::with_parts(
        IosConfig::default(),
        Box::new(GuestRam::new()),
        Box::new(HeadlessCpu::running()),
        Box::new(FixedEntryLoader(0x8000_3400)),
        MemoryNand::new().into_shared(),
    );
    ios.boot(titles::ios(9), true, Some(Path::new("boot.dol"))).unwrap();
    assert!(!ios.cpu().is_running());

    ios.run_for(ios.config().timings.legacy_boot_ticks);
    assert_eq!(ios.boot_state(), BootState::Running);
    assert!(ios.cpu().is_running());
}

#[test]
fn failed_companion_load_leaves_ipc_paused() {
    let mut ios = Ios::new(IosConfig::default());
    let err = ios
        .boot(titles::ios(36), false, Some(Path::new("missing.dol")))
        .unwrap_err();
    assert!(matches!(err, BootError::Companion { .. }));
    assert!(ios.kernel().is_paused());
    assert_eq!(ios.boot_state(), BootState::SwapRequested);
    assert_eq!(ios.kernel().title_id(), titles::SYSTEM_MENU_IOS);
}

#[test]
fn requests_submitted_during_reload_are_served_by_the_new_kernel() {
    let mut g = Guest::new();
    g.ios.boot(titles::ios(36), false, None).unwrap();
    let block = g.submit_open("/dev/fs", 3);

    let queued = g.ios.now() + g.ios.config().timings.ack_delay;
    g.ios.run_until(queued);
    assert!(g.ios.kernel().is_paused());
    assert_eq!(g.ios.kernel().queued_requests(), 1);
    assert!(g.acks().is_empty());

    g.settle();
    assert_eq!(g.ios.kernel().title_id(), titles::ios(36));
    assert_eq!(g.acks(), vec![block]);
    assert_eq!(g.result(block), Some(0));
}

#[test]
fn new_kernel_serves_requests_after_reload() {
    let mut g = Guest::new();
    launch(&mut g, titles::ios(36));
    g.settle();
    assert_eq!(g.open("/dev/fs"), 0);
    assert_eq!(g.close(0), IPC_SUCCESS);
}
