//! Identify and namespace enumeration: controller attributes, LBA format
//! decoding, attach, and storage registration.

mod common;

use common::{bring_up, ns};
use petrel_nvme_sim::{SimConfig, SimNvmeDevice};
use pretty_assertions::assert_eq;

#[test]
fn enumerates_namespaces_with_identify_geometry() {
    let device = SimNvmeDevice::new(
        SimConfig {
            mdts: 5,
            cntlid: 7,
            ..SimConfig::default()
        },
        vec![ns(3, 1_048_576, 9), ns(5, 4096, 12)],
    );
    let controller = bring_up(&device);

    assert_eq!(controller.cntlid(), 7);
    // (1 << MDTS) * min page size.
    assert_eq!(controller.max_transfer(), Some(32 * 4096));

    let namespaces = controller.namespaces();
    assert_eq!(namespaces.len(), 2);
    assert_eq!(namespaces[0].nsid(), 3);
    assert_eq!(namespaces[1].nsid(), 5);

    use petrel_platform::BlockDevice;
    assert_eq!(namespaces[0].sector_size(), 512);
    assert_eq!(namespaces[0].sector_count(), 1_048_576);
    assert_eq!(namespaces[1].sector_size(), 4096);
    assert_eq!(namespaces[1].sector_count(), 4096);

    let sim = device.controller();
    assert!(sim.attached(3));
    assert!(sim.attached(5));
}

#[test]
fn registers_each_namespace_with_the_storage_registry() {
    let device = SimNvmeDevice::new(SimConfig::default(), vec![ns(3, 2048, 9), ns(5, 2048, 9)]);
    bring_up(&device);
    assert_eq!(device.registry.names(), vec!["nvme0", "nvme1"]);
    assert!(device.registry.get("nvme0").is_some());
}

#[test]
fn admin_command_sequence_and_field_packing() {
    let depth = 64u32;
    let device = SimNvmeDevice::new(SimConfig::default(), vec![ns(3, 2048, 9)]);
    bring_up(&device);

    let sim = device.controller();
    let admin: Vec<_> = sim.stats.commands.iter().filter(|c| c.qid == 0).collect();

    // identify(controller), create CQ, create SQ, identify(active list),
    // identify(namespace 3), attach(3).
    let opcodes: Vec<u8> = admin.iter().map(|c| c.opcode).collect();
    assert_eq!(opcodes, vec![0x06, 0x05, 0x01, 0x06, 0x06, 0x15]);

    let identify_controller = admin[0];
    assert_eq!(identify_controller.cdw10 & 0xFFFF, 0x01);
    assert_eq!(identify_controller.nsid, 0);
    assert_eq!(identify_controller.prp2, 0);

    let create_cq = admin[1];
    assert_eq!(create_cq.cdw10, depth << 16 | 1);
    // Interrupt enable + physically contiguous, vector 0.
    assert_eq!(create_cq.cdw11, 0x3);

    let create_sq = admin[2];
    assert_eq!(create_sq.cdw10, depth << 16 | 1);
    // CQ id 1, urgent priority, physically contiguous.
    assert_eq!(create_sq.cdw11, 1 << 16 | 3 << 1 | 1);

    let identify_list = admin[3];
    assert_eq!(identify_list.cdw10 & 0xFFFF, 0x02);

    let identify_ns = admin[4];
    assert_eq!(identify_ns.cdw10 & 0xFFFF, 0x00);
    assert_eq!(identify_ns.nsid, 3);

    let attach = admin[5];
    assert_eq!(attach.nsid, 3);
    assert_eq!(attach.cdw10, 0);
    assert_eq!(attach.sc, 0);

    // Every admin command completed successfully.
    assert!(admin.iter().all(|c| c.sc == 0 && c.sct == 0));
}

#[test]
fn every_command_fires_one_interrupt() {
    let device = SimNvmeDevice::new(SimConfig::default(), vec![ns(3, 2048, 9)]);
    bring_up(&device);

    let commands = device.controller().stats.commands.len();
    assert_eq!(device.interrupts.fired(), commands as u32);
}
