mod common;

use std::sync::Arc;

use mpt_engine::{BringUpError, Error, HandshakeError, Hardware, Ioc, Phase, Sizing};
use mpt_protocol::{EventCode, IocState, TaskMgmtRequest, WhoInit};
use mpt_sim::{SimConfig, SimIoc};

use common::{attach, fast_config, new_ioc};

fn firmware_image() -> Vec<u8> {
    (0..1000u32).map(|i| (i * 7 % 251) as u8).collect()
}

#[test]
fn attach_reaches_operational() {
    let (sim, ioc) = attach(SimConfig::default());

    assert_eq!(ioc.phase(), Phase::Operational);
    assert_eq!(ioc.ioc_state(), IocState::Operational);
    assert_eq!(
        ioc.sizing(),
        Some(Sizing {
            frame_size: 128,
            request_depth: 64,
            reply_depth: 64,
            reply_frame_size: 80,
            chain_depth: 8,
        })
    );
    assert_eq!(ioc.port_facts().len(), 1);
    assert_eq!(ioc.facts().map(|f| f.fw_version), Some(0x0112_0300));

    let stats = sim.stats();
    assert_eq!(stats.ioc_inits, 1);
    assert_eq!(stats.port_enables, 1);
    assert_eq!(stats.event_notifications, 1);
    assert_eq!(sim.reply_frame_size(), 80);
    // The event reply's frame went back to the controller.
    assert_eq!(sim.free_reply_frames(), 64);

    assert!(ioc.events_enabled());
    let log = ioc.event_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].event, EventCode::EventChange as u32);
    assert_eq!(log[0].data, vec![1]);

    // Only the event notification frame stays with the controller.
    let arena = ioc.arena_stats().unwrap();
    assert_eq!(arena.submitted, 1);
    assert_eq!(arena.free, 63);
}

#[test]
fn second_bring_up_does_not_re_enable_events() {
    let (sim, ioc) = attach(SimConfig::default());
    ioc.bring_up().unwrap();

    let stats = sim.stats();
    assert_eq!(stats.message_unit_resets, 1);
    assert_eq!(stats.hard_resets, 0);
    assert_eq!(stats.ioc_inits, 2);
    assert_eq!(stats.event_notifications, 1);
    assert!(ioc.events_enabled());
    assert_eq!(ioc.arena_stats().unwrap().submitted, 1);
    assert_eq!(sim.free_reply_frames(), 64);
}

#[test]
fn peer_owned_controller_is_left_alone() {
    let sim = Arc::new(SimIoc::new(SimConfig {
        initial_state: IocState::Operational,
        initial_who_init: WhoInit::PciPeer,
        ..SimConfig::default()
    }));
    let hw: Arc<dyn Hardware> = sim.clone();

    let res = Ioc::attach("ioc0", hw, fast_config());
    assert_eq!(res.err(), Some(Error::BringUp(BringUpError::OwnedByPeer)));
    assert_eq!(sim.stats().handshakes, 0);
    assert_eq!(sim.stats().message_unit_resets, 0);
}

#[test]
fn silent_controller_times_out_facts() {
    let sim = Arc::new(SimIoc::default());
    sim.set_silent(true);
    let ioc = new_ioc(
        &sim,
        mpt_engine::IocConfig {
            facts_retries: 2,
            ..fast_config()
        },
    );

    assert_eq!(
        ioc.bring_up(),
        Err(BringUpError::Handshake {
            step: "IOC facts",
            source: HandshakeError::ReplyTimeout,
        })
    );
    assert_eq!(sim.stats().handshakes, 2);
    assert_eq!(ioc.phase(), Phase::Faulted);
}

#[test]
fn tiny_request_frames_abort_bring_up() {
    let sim = Arc::new(SimIoc::new(SimConfig {
        request_frame_dwords: 2,
        ..SimConfig::default()
    }));
    let ioc = new_ioc(&sim, fast_config());

    assert_eq!(
        ioc.bring_up(),
        Err(BringUpError::FrameTooSmall {
            frame_size: 8,
            min: TaskMgmtRequest::SIZE,
        })
    );
    assert_eq!(ioc.phase(), Phase::Faulted);
    assert_eq!(ioc.sizing(), None);
    assert_eq!(ioc.arena_stats(), None);
    assert_eq!(sim.stats().ioc_inits, 0);
}

#[test]
fn faulted_controller_is_hard_reset_before_bring_up() {
    let sim = Arc::new(SimIoc::default());
    sim.inject_fault(0x0123);
    let ioc = new_ioc(&sim, fast_config());

    ioc.bring_up().unwrap();
    assert_eq!(ioc.last_fault(), Some(0x0123));
    assert_eq!(sim.stats().hard_resets, 1);
    assert_eq!(sim.state(), IocState::Operational);
}

#[test]
fn firmware_is_uploaded_once_and_booted_after_reset() {
    let image = firmware_image();
    let (sim, ioc) = attach(SimConfig {
        firmware: Some(image.clone()),
        ..SimConfig::default()
    });
    assert_eq!(ioc.cached_firmware().as_deref(), Some(&image[..]));
    assert_eq!(sim.stats().fw_uploads, 1);

    ioc.recover("test").unwrap();
    let stats = sim.stats();
    assert_eq!(stats.hard_resets, 1);
    assert_eq!(stats.download_boots, 1);
    assert_eq!(stats.fw_uploads, 1);
    // A hard reset drops the event state, so notification is requested again.
    assert_eq!(stats.event_notifications, 2);
    assert_eq!(ioc.phase(), Phase::Operational);
    assert_eq!(ioc.recoveries(), 1);
}

#[test]
fn short_firmware_upload_aborts_bring_up() {
    let sim = Arc::new(SimIoc::new(SimConfig {
        firmware: Some(firmware_image()),
        ..SimConfig::default()
    }));
    sim.set_fw_size_mismatch(true);
    let ioc = new_ioc(&sim, fast_config());

    assert_eq!(
        ioc.bring_up(),
        Err(BringUpError::FirmwareSizeMismatch {
            expected: 1000,
            actual: 1004,
        })
    );
    assert!(ioc.cached_firmware().is_none());
}
