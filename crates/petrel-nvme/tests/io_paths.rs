//! Read/write paths: PRP shapes, command splitting, round-trips and failure
//! accounting.

mod common;

use common::{bring_up, ns};
use petrel_nvme_sim::{CapturedCommand, SimConfig, SimNvmeDevice};
use petrel_platform::BlockDevice;
use pretty_assertions::assert_eq;

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

fn io_commands(device: &SimNvmeDevice) -> Vec<CapturedCommand> {
    device
        .controller()
        .stats
        .commands
        .iter()
        .filter(|c| c.qid == 1)
        .cloned()
        .collect()
}

#[test]
fn single_block_read_uses_prp1_only() {
    let device = SimNvmeDevice::new(SimConfig::default(), vec![ns(3, 2048, 9)]);
    let image = pattern(512, 7);
    device.controller().write_namespace(3, 0, &image);

    let controller = bring_up(&device);
    let namespace = &controller.namespaces()[0];

    let mut buf = vec![0u8; 512];
    assert_eq!(namespace.read(&mut buf, 0, 1), 1);
    assert_eq!(buf, image);

    let commands = io_commands(&device);
    assert_eq!(commands.len(), 1);
    let read = &commands[0];
    assert_eq!(read.opcode, 0x02);
    assert_eq!(read.nsid, 3);
    assert_eq!(read.cdw10, 0);
    assert_eq!(read.cdw11, 0);
    assert_eq!(read.cdw12 & 0xFFFF, 0); // zero-based block count
    assert_eq!(read.prp1 % 4096, 0);
    assert_eq!(read.prp2, 0);
}

#[test]
fn two_page_read_populates_prp2() {
    let device = SimNvmeDevice::new(SimConfig::default(), vec![ns(3, 2048, 9)]);
    let image = pattern(12 * 512, 3);
    device.controller().write_namespace(3, 0, &image);

    let controller = bring_up(&device);
    let namespace = &controller.namespaces()[0];

    // 12 blocks = 6 KiB: two pages, one command.
    let mut buf = vec![0u8; 12 * 512];
    assert_eq!(namespace.read(&mut buf, 0, 12), 12);
    assert_eq!(buf, image);

    let commands = io_commands(&device);
    assert_eq!(commands.len(), 1);
    let read = &commands[0];
    assert_eq!(read.prp2, read.prp1 + 4096);
}

#[test]
fn high_lba_lands_in_cdw11() {
    let blocks = 1u64 << 33; // namespace large enough for a >32-bit LBA
    let device = SimNvmeDevice::new(SimConfig::default(), vec![ns(3, blocks, 9)]);
    let controller = bring_up(&device);
    let namespace = &controller.namespaces()[0];

    let start = (1u64 << 32) + 5;
    let mut buf = vec![0u8; 512];
    assert_eq!(namespace.read(&mut buf, start, 1), 1);

    let read = &io_commands(&device)[0];
    assert_eq!(read.cdw10, 5);
    assert_eq!(read.cdw11, 1);
}

#[test]
fn requests_above_the_command_cap_are_split() {
    // MDTS = 2: 4 pages = 16 KiB per command = 32 blocks of 512 bytes.
    let device = SimNvmeDevice::new(
        SimConfig {
            mdts: 2,
            ..SimConfig::default()
        },
        vec![ns(3, 4096, 9)],
    );
    let image = pattern(42 * 512, 11);
    device.controller().write_namespace(3, 0, &image);

    let controller = bring_up(&device);
    let namespace = &controller.namespaces()[0];

    let mut buf = vec![0u8; 42 * 512];
    assert_eq!(namespace.read(&mut buf, 0, 42), 42);
    assert_eq!(buf, image);

    let commands = io_commands(&device);
    assert_eq!(commands.len(), 2);
    assert_eq!(commands[0].cdw10, 0);
    assert_eq!(commands[0].cdw12 & 0xFFFF, 31); // 32 blocks, zero-based
    assert_eq!(commands[1].cdw10, 32);
    assert_eq!(commands[1].cdw12 & 0xFFFF, 9); // the remaining 10

    // Sub-counts cover the request exactly.
    let total: u32 = commands.iter().map(|c| (c.cdw12 & 0xFFFF) + 1).sum();
    assert_eq!(total, 42);
}

#[test]
fn round_trips_across_prp_shapes() {
    // Block counts chosen to cross every PRP regime: single page, exactly
    // two pages, PRP list, and a list spilling into a second list page
    // (513 data pages).
    let cases: &[u32] = &[1, 16, 17, 100, 4104];
    for &count in cases {
        let device = SimNvmeDevice::new(SimConfig::default(), vec![ns(3, 8192, 9)]);
        let controller = bring_up(&device);
        let namespace = &controller.namespaces()[0];

        let bytes = count as usize * 512;
        let image = pattern(bytes, count as u8);
        assert_eq!(namespace.write(&image, 3, count), count, "count={count}");

        let mut back = vec![0u8; bytes];
        assert_eq!(namespace.read(&mut back, 3, count), count, "count={count}");
        assert_eq!(back, image, "count={count}");

        // The image landed on the simulated medium, not just in staging.
        let on_disk = device.controller().read_namespace(3, 3, count as usize);
        assert_eq!(on_disk, image, "count={count}");
    }
}

#[test]
fn round_trip_across_the_split_boundary() {
    let device = SimNvmeDevice::new(
        SimConfig {
            mdts: 2, // 32-block commands
            ..SimConfig::default()
        },
        vec![ns(3, 4096, 9)],
    );
    let controller = bring_up(&device);
    let namespace = &controller.namespaces()[0];

    let image = pattern(70 * 512, 23);
    assert_eq!(namespace.write(&image, 100, 70), 70);
    let mut back = vec![0u8; 70 * 512];
    assert_eq!(namespace.read(&mut back, 100, 70), 70);
    assert_eq!(back, image);

    // 70 blocks at a 32-block cap: ceil(70/32) = 3 commands per direction.
    let reads = io_commands(&device)
        .iter()
        .filter(|c| c.opcode == 0x02)
        .count();
    let writes = io_commands(&device)
        .iter()
        .filter(|c| c.opcode == 0x01)
        .count();
    assert_eq!((writes, reads), (3, 3));
}

#[test]
fn io_releases_all_staging_and_prp_regions() {
    let device = SimNvmeDevice::new(SimConfig::default(), vec![ns(3, 8192, 9)]);
    let controller = bring_up(&device);
    let namespace = &controller.namespaces()[0];
    let baseline = device.memory.outstanding_regions();

    let image = pattern(4104 * 512, 5);
    assert_eq!(namespace.write(&image, 0, 4104), 4104);
    let mut back = vec![0u8; 4104 * 512];
    assert_eq!(namespace.read(&mut back, 0, 4104), 4104);

    // Staging buffers and PRP-list pages are all owned per command and
    // released with it.
    assert_eq!(device.memory.outstanding_regions(), baseline);
}

#[test]
fn zero_count_transfers_return_zero_without_commands() {
    let device = SimNvmeDevice::new(SimConfig::default(), vec![ns(3, 2048, 9)]);
    let controller = bring_up(&device);
    let namespace = &controller.namespaces()[0];

    let mut buf = [0u8; 512];
    assert_eq!(namespace.read(&mut buf, 0, 0), 0);
    assert_eq!(namespace.write(&buf, 0, 0), 0);
    assert!(io_commands(&device).is_empty());
}

#[test]
fn out_of_range_read_reports_zero_blocks() {
    let device = SimNvmeDevice::new(SimConfig::default(), vec![ns(3, 16, 9)]);
    let controller = bring_up(&device);
    let namespace = &controller.namespaces()[0];

    let mut buf = vec![0u8; 2 * 512];
    assert_eq!(namespace.read(&mut buf, 15, 2), 0);

    let commands = io_commands(&device);
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].sc, 0x80); // LBA out of range
}

#[test]
fn undersized_buffer_is_rejected_without_commands() {
    let device = SimNvmeDevice::new(SimConfig::default(), vec![ns(3, 2048, 9)]);
    let controller = bring_up(&device);
    let namespace = &controller.namespaces()[0];

    let mut buf = vec![0u8; 512];
    assert_eq!(namespace.read(&mut buf, 0, 4), 0);
    assert_eq!(namespace.write(&buf, 0, 4), 0);
    assert!(io_commands(&device).is_empty());
}

#[test]
fn queue_wrap_survives_many_sequential_commands() {
    // MQES = 3 gives queue depth 4, so a burst of commands wraps both rings
    // and flips the completion phase repeatedly.
    let device = SimNvmeDevice::new(
        SimConfig {
            mqes: 3,
            ..SimConfig::default()
        },
        vec![ns(3, 2048, 9)],
    );
    let controller = bring_up(&device);
    let namespace = &controller.namespaces()[0];
    assert_eq!(controller.queue_depth(), 4);

    for i in 0..10u32 {
        let image = pattern(512, i as u8);
        assert_eq!(namespace.write(&image, i as u64, 1), 1, "write {i}");
    }
    for i in 0..10u32 {
        let mut back = vec![0u8; 512];
        assert_eq!(namespace.read(&mut back, i as u64, 1), 1, "read {i}");
        assert_eq!(back, pattern(512, i as u8), "read {i}");
    }
}
