mod common;

use common::Guest;
use ios_hle::device::{dolphin, fs as fs_device, stm, Completion};
use ios_hle::ipc::{IoctlRequest, IpcReply, IPC_EEXIST, IPC_EINVAL, IPC_EMAX, IPC_ENOENT, IPC_SUCCESS};
use ios_hle::{Device, DeviceBase, DeviceContext, IosConfig, IPC_MAX_FDS};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

#[test]
fn fs_stats_through_a_manager_descriptor() {
    let mut g = Guest::new();
    let fd = g.open("/dev/fs");
    assert_eq!(fd, 0);

    let out = g.alloc(0x1C);
    let rv = g.call(|g| g.submit_ioctl(0, fs_device::IOCTL_GET_STATS, (0, 0), (out, 0x1C)));
    assert_eq!(rv, IPC_SUCCESS);
    let expected = g.ios.fs().borrow().stats().to_be_bytes();
    assert_eq!(g.mem().copy_out(out, expected.len()), expected.to_vec());

    assert_eq!(g.close(fd), IPC_SUCCESS);
    assert_eq!(g.ios.kernel().fds().open_count(), 0);
    assert!(g.ios.kernel().device_by_fd(0).is_none());
}

#[test]
fn unknown_paths_do_not_consume_descriptors() {
    let mut g = Guest::new();
    assert_eq!(g.open("/dev/does/not/exist"), IPC_ENOENT);
    assert_eq!(g.open("relative/path"), IPC_ENOENT);
    assert_eq!(g.open("/dev/es"), 0);
}

#[test]
fn nand_paths_route_to_the_filesystem() {
    let mut g = Guest::new();
    assert_eq!(g.open("/title/missing.bin"), ios_hle::ipc::FS_ENOENT);
    assert_eq!(g.ios.kernel().fds().open_count(), 0);
}

#[test]
fn descriptor_table_fills_up_and_reuses_the_lowest_slot() {
    let mut g = Guest::new();
    for expected in 0..IPC_MAX_FDS as i32 {
        assert_eq!(g.open("/dev/es"), expected);
    }
    assert_eq!(g.open("/dev/es"), IPC_EMAX);

    assert_eq!(g.close(5), IPC_SUCCESS);
    assert_eq!(g.close(9), IPC_SUCCESS);
    assert_eq!(g.open("/dev/stm/immediate"), 5);
    assert_eq!(g.open("/dev/es"), 9);
}

#[test]
fn full_table_reply_uses_its_own_latency() {
    let mut g = Guest::new();
    for _ in 0..IPC_MAX_FDS {
        g.open("/dev/es");
    }
    let start = g.ios.now();
    let block = g.submit_open("/dev/es", 3);
    let timings = g.ios.config().timings;
    let due = start + timings.ack_delay + timings.too_many_files_delay;

    g.ios.run_until(due - 1);
    assert_eq!(g.result(block), None);
    g.ios.run_until(due);
    assert_eq!(g.result(block), Some(IPC_EMAX));
}

#[test]
fn invalid_descriptors_bypass_devices() {
    let mut g = Guest::new();
    let timings = g.ios.config().timings;

    let closed = g.submit_ioctl(3, 0, (0, 0), (0, 0));
    let due = timings.ack_delay + timings.invalid_fd_delay;
    g.ios.run_until(due - 1);
    assert_eq!(g.result(closed), None);
    g.ios.run_until(due);
    assert_eq!(g.result(closed), Some(IPC_EINVAL));

    assert_eq!(g.call(|g| g.submit_close(0x40)), IPC_EINVAL);
}

#[test]
fn unknown_and_reply_commands_are_rejected() {
    let mut g = Guest::new();
    let timings = g.ios.config().timings;
    let bogus = g.submit_raw(0x20, 0);
    let reply = g.submit_raw(8, 0);
    let due = timings.ack_delay + timings.invalid_command_delay;
    g.ios.run_until(due);
    assert_eq!(g.result(bogus), Some(IPC_EINVAL));
    g.settle();
    assert_eq!(g.result(reply), Some(IPC_EINVAL));
}

#[test]
fn reply_writes_back_the_command_word() {
    let mut g = Guest::new();
    let block = g.submit_open("/dev/es", 3);
    g.settle();
    assert_eq!(g.mem().read_u32(block), 8);
    assert_eq!(g.mem().read_u32(block + 8), 1);
    assert_eq!(g.replies(), vec![block]);
    assert_eq!(g.acks(), vec![block]);
}

#[test]
fn usb_peripheral_is_held_by_one_descriptor() {
    let config = IosConfig {
        usb_devices: vec![(0x057E, 0x0308)],
        ..IosConfig::default()
    };
    let mut g = Guest::with_config(config);
    assert_eq!(g.open("/dev/usb/oh0/57e/308"), 0);
    assert_eq!(g.open("/dev/usb/oh0/57e/308"), IPC_EEXIST);
    assert_eq!(g.open("/dev/usb/oh0/1/2"), IPC_ENOENT);
    assert!(g.ios.usb().borrow().is_open(0x057E, 0x0308));

    assert_eq!(g.close(0), IPC_SUCCESS);
    assert!(!g.ios.usb().borrow().is_open(0x057E, 0x0308));
    assert_eq!(g.open("/dev/usb/oh0/57e/308"), 0);
}

#[test]
fn stm_hook_reply_is_ordered_after_earlier_replies() {
    let mut g = Guest::new();
    let hook_fd = g.open("/dev/stm/eventhook") as u32;
    let out = g.alloc(4);
    let hook = g.submit_ioctl(hook_fd, stm::IOCTL_EVENTHOOK, (0, 0), (out, 4));
    g.settle();
    assert_eq!(g.result(hook), None);

    // A slow reply scheduled first must still land first.
    let parked = g.alloc(0x40);
    g.mem().write_u32(parked, 6);
    let parked_request = ios_hle::Request {
        address: parked,
        command: 6,
        fd: hook_fd,
    };
    g.ios.enqueue_reply(&parked_request, IPC_SUCCESS, Some(50_000));
    assert!(g.ios.press_power_button());
    assert!(!g.ios.press_power_button());
    g.settle();

    assert_eq!(g.result(hook), Some(IPC_SUCCESS));
    assert_eq!(g.mem().read_u32(out), stm::STM_EVENT_POWER);
    let replies = g.replies();
    let parked_pos = replies.iter().position(|a| *a == parked).unwrap();
    let hook_pos = replies.iter().position(|a| *a == hook).unwrap();
    assert!(parked_pos < hook_pos);
}

#[test]
fn release_event_hook_answers_the_parked_request() {
    let mut g = Guest::new();
    let hook_fd = g.open("/dev/stm/eventhook") as u32;
    let imm_fd = g.open("/dev/stm/immediate") as u32;
    let out = g.alloc(4);
    let hook = g.submit_ioctl(hook_fd, stm::IOCTL_EVENTHOOK, (0, 0), (out, 4));
    let release = g.submit_ioctl(imm_fd, stm::IOCTL_RELEASE_EH, (0, 0), (0, 0));
    g.settle();

    assert_eq!(g.result(release), Some(IPC_SUCCESS));
    assert_eq!(g.result(hook), Some(IPC_SUCCESS));
    let replies = g.replies();
    let release_pos = replies.iter().position(|a| *a == release).unwrap();
    let hook_pos = replies.iter().position(|a| *a == hook).unwrap();
    assert!(release_pos < hook_pos);

    assert_eq!(g.call(|g| g.submit_ioctl(imm_fd, stm::IOCTL_RELEASE_EH, (0, 0), (0, 0))), IPC_ENOENT);
}

#[test]
fn dolphin_reports_system_time() {
    let mut g = Guest::new();
    let fd = g.open("/dev/dolphin") as u32;
    let out = g.alloc(8);
    let rv = g.call(|g| g.submit_ioctlv(fd, dolphin::IOCTLV_GET_SYSTEM_TIME, &[], &[(out, 8)]));
    assert_eq!(rv, IPC_SUCCESS);
    assert!(g.mem().read_u64(out) >= g.ios.config().system_time_base_ms);
}

/// Finishes every ioctl on a worker thread.
struct Offloaded {
    base: DeviceBase,
}

impl Device for Offloaded {
    fn base(&self) -> &DeviceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase {
        &mut self.base
    }

    fn ioctl(&mut self, ctx: &mut DeviceContext<'_>, request: &IoctlRequest) -> Option<IpcReply> {
        let sender = ctx.completion_sender();
        let request = request.request;
        std::thread::spawn(move || {
            assert!(sender.send(Completion {
                request,
                return_value: 7,
                delay: Some(100),
            }));
        })
        .join()
        .unwrap();
        None
    }
}

#[test]
fn background_completions_are_delivered_on_update() {
    let mut g = Guest::new();
    g.ios.kernel_mut().registry_mut().register_static(Box::new(Offloaded {
        base: DeviceBase::new("/dev/offloaded"),
    }));
    let fd = g.open("/dev/offloaded") as u32;
    let block = g.submit_ioctl(fd, 1, (0, 0), (0, 0));
    g.settle();
    assert_eq!(g.result(block), None);

    g.ios.update_devices();
    g.settle();
    assert_eq!(g.result(block), Some(7));
}

/// Counts periodic updates.
struct Ticker {
    base: DeviceBase,
    updates: u32,
}

impl Device for Ticker {
    fn base(&self) -> &DeviceBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut DeviceBase {
        &mut self.base
    }

    fn update(&mut self, _ctx: &mut DeviceContext<'_>) {
        self.updates += 1;
    }
}

fn ticker_updates(g: &Guest) -> u32 {
    g.ios
        .kernel()
        .registry()
        .device::<Ticker>("/dev/ticker")
        .map(|t| t.updates)
        .unwrap_or_default()
}

#[test]
fn static_device_is_updated_while_any_descriptor_holds_it() {
    let mut g = Guest::new();
    g.ios.kernel_mut().registry_mut().register_static(Box::new(Ticker {
        base: DeviceBase::new("/dev/ticker"),
        updates: 0,
    }));
    g.ios.update_devices();
    assert_eq!(ticker_updates(&g), 0);

    let first = g.open("/dev/ticker");
    let second = g.open("/dev/ticker");
    g.ios.update_devices();
    assert_eq!(ticker_updates(&g), 1);

    assert_eq!(g.close(first), IPC_SUCCESS);
    assert!(g.ios.kernel().device_by_name("/dev/ticker").unwrap().is_active());
    g.ios.update_devices();
    assert_eq!(ticker_updates(&g), 2);

    assert_eq!(g.close(second), IPC_SUCCESS);
    g.ios.update_devices();
    assert_eq!(ticker_updates(&g), 2);
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Open,
    BadFd,
    BadCommand,
    UnknownDevice,
}

fn op() -> impl Strategy<Value = (Op, u64)> {
    (
        prop_oneof![Just(Op::Open), Just(Op::BadFd), Just(Op::BadCommand), Just(Op::UnknownDevice)],
        0u64..6_000,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Replies with mixed latencies still reach the guest in submission order.
    #[test]
    fn replies_arrive_in_submission_order(ops in proptest::collection::vec(op(), 1..24)) {
        let mut g = Guest::new();
        let mut blocks = Vec::new();
        for (op, gap) in ops {
            let block = match op {
                Op::Open => g.submit_open("/dev/es", 3),
                Op::BadFd => g.submit_ioctl(0x17, 0, (0, 0), (0, 0)),
                Op::BadCommand => g.submit_raw(0x99, 0),
                Op::UnknownDevice => g.submit_open("/dev/nowhere", 3),
            };
            blocks.push(block);
            g.ios.run_for(gap);
        }
        g.settle();
        prop_assert_eq!(g.replies(), blocks);
    }
}
