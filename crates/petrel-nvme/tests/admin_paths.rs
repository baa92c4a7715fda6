//! Admin-path edge cases: attach idempotence and failure tolerance, and the
//! bounded completion wait.

mod common;

use std::sync::Arc;

use common::{bring_up, ns};
use petrel_nvme::{AttachOutcome, NvmeError};
use petrel_nvme_sim::{SimConfig, SimNamespaceConfig, SimNvmeDevice};
use petrel_platform::{BlockDevice, MemoryService};
use pretty_assertions::assert_eq;

#[test]
fn attaching_twice_reports_already_attached_and_changes_nothing() {
    let device = SimNvmeDevice::new(SimConfig::default(), vec![ns(3, 2048, 9)]);
    let controller = bring_up(&device);
    assert!(device.controller().attached(3));

    let outcome = controller
        .admin()
        .attach_namespace(controller.cntlid(), 3)
        .unwrap();
    assert_eq!(outcome, AttachOutcome::AlreadyAttached);

    // The namespace stays attached and usable.
    assert!(device.controller().attached(3));
    let namespace = &controller.namespaces()[0];
    let mut buf = vec![0u8; 512];
    assert_eq!(namespace.read(&mut buf, 0, 1), 1);
}

#[test]
fn pre_attached_namespace_survives_bring_up() {
    let device = SimNvmeDevice::new(
        SimConfig::default(),
        vec![SimNamespaceConfig {
            nsid: 3,
            blocks: 2048,
            lbads: 9,
            attached: true,
        }],
    );
    let controller = bring_up(&device);

    // The attach during enumeration came back 0x18 and was tolerated.
    let sim = device.controller();
    let attach = sim
        .stats
        .commands
        .iter()
        .find(|c| c.opcode == 0x15)
        .expect("attach was issued");
    assert_eq!(attach.sc, 0x18);
    drop(sim);

    assert_eq!(controller.namespaces().len(), 1);
    assert_eq!(device.registry.names(), vec!["nvme0"]);
}

#[test]
fn attach_unsupported_is_tolerated() {
    let device = SimNvmeDevice::new(
        SimConfig {
            attach_unsupported: true,
            ..SimConfig::default()
        },
        vec![ns(3, 2048, 9)],
    );
    let controller = bring_up(&device);
    assert_eq!(controller.namespaces().len(), 1);

    let outcome = controller
        .admin()
        .attach_namespace(controller.cntlid(), 3)
        .unwrap();
    assert_eq!(outcome, AttachOutcome::Unsupported);
}

#[test]
fn lost_completion_times_out_and_read_reports_zero() {
    let device = SimNvmeDevice::new(SimConfig::default(), vec![ns(3, 2048, 9)]);
    let controller = bring_up(&device);
    device.controller().set_drop_completions(true);

    let namespace = &controller.namespaces()[0];
    let mut buf = vec![0u8; 512];
    assert_eq!(namespace.read(&mut buf, 0, 1), 0);
}

#[test]
fn lost_completion_surfaces_as_timeout_on_admin_commands() {
    let device = SimNvmeDevice::new(SimConfig::default(), vec![ns(3, 2048, 9)]);
    let controller = bring_up(&device);
    device.controller().set_drop_completions(true);

    let memory: Arc<dyn MemoryService> = Arc::new(device.memory.clone());
    let buffer = memory.map_io(4096).unwrap();
    let err = controller
        .admin()
        .identify(&buffer, 0x01, 0)
        .unwrap_err();
    assert!(matches!(err, NvmeError::CompletionTimeout { .. }));
}
