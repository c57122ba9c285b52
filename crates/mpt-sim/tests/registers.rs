use std::time::Duration;

use mpt_engine::{Handshake, HandshakeError, Hardware};
use mpt_protocol::regs::{HostDiagnostic, WRITE_SEQUENCE_KEYS, WRITE_SEQUENCE_LOCK};
use mpt_protocol::{
    DefaultReply, DoorbellFunction, DoorbellStatus, EventNotificationRequest, IocFactsReply,
    IocFactsRequest, IocInitRequest, IocState, IocStatus, PortFactsReply, PortFactsRequest,
    Register, ReplyDescriptor, WhoInit,
};
use mpt_sim::{SimConfig, SimIoc, FAULT_BAD_IMAGE};

fn handshake() -> Handshake {
    Handshake::new("sim0", Duration::from_millis(200), Duration::from_millis(1))
}

fn exchange(sim: &SimIoc, request: &[u8]) -> Result<Vec<u8>, HandshakeError> {
    let mut reply = [0u8; 128];
    let n = handshake().exchange(sim, request, &mut reply, Duration::from_millis(200))?;
    Ok(reply[..n].to_vec())
}

fn ioc_init() -> [u8; IocInitRequest::SIZE] {
    IocInitRequest {
        who_init: WhoInit::HostDriver,
        flags: 0,
        max_devices: 16,
        max_buses: 1,
        msg_context: 0,
        reply_frame_size: 80,
        host_mfa_high_addr: 0,
        sense_buffer_high_addr: 0,
        reply_fifo_host_signaling_addr: 0,
        msg_version: 0x0105,
        header_version: 0x0a00,
    }
    .to_bytes()
}

fn doorbell(sim: &SimIoc) -> DoorbellStatus {
    DoorbellStatus::decode(sim.read_reg(Register::Doorbell))
}

fn diag(sim: &SimIoc) -> HostDiagnostic {
    HostDiagnostic::from_bits_retain(sim.read_reg(Register::HostDiagnostic))
}

fn unlock(sim: &SimIoc) {
    sim.write_reg(Register::WriteSequence, WRITE_SEQUENCE_LOCK);
    for key in WRITE_SEQUENCE_KEYS {
        sim.write_reg(Register::WriteSequence, key);
    }
}

#[test]
fn facts_come_back_through_the_doorbell() {
    let sim = SimIoc::default();
    let reply = exchange(&sim, &IocFactsRequest { msg_context: 0x55 }.to_bytes()).unwrap();
    let facts = IocFactsReply::parse(&reply).unwrap();

    assert_eq!(reply.len(), IocFactsReply::SIZE);
    assert_eq!(facts.msg_context, 0x55);
    assert_eq!(facts.global_credits, 64);
    assert_eq!(facts.request_frame_size, 32);
    assert_eq!(facts.number_of_ports, 1);
    assert!(!facts.fw_download_boot());
    assert!(!doorbell(&sim).active);
    assert_eq!(sim.stats().handshakes, 1);
}

#[test]
fn missing_port_reports_invalid_field() {
    let sim = SimIoc::default();
    let request = PortFactsRequest {
        port_number: 3,
        msg_context: 0,
    }
    .to_bytes();
    let reply = PortFactsReply::parse(&exchange(&sim, &request).unwrap()).unwrap();
    assert_eq!(reply.ioc_status.code(), IocStatus::INVALID_FIELD);
}

#[test]
fn ioc_init_only_from_ready() {
    let sim = SimIoc::default();
    let first = DefaultReply::parse(&exchange(&sim, &ioc_init()).unwrap()).unwrap();
    assert!(first.ioc_status.is_success());
    assert_eq!(sim.state(), IocState::Operational);
    assert_eq!(doorbell(&sim).who_init, WhoInit::HostDriver as u8);
    assert_eq!(sim.reply_frame_size(), 80);

    let second = DefaultReply::parse(&exchange(&sim, &ioc_init()).unwrap()).unwrap();
    assert_eq!(second.ioc_status.code(), IocStatus::INVALID_STATE);
    assert_eq!(sim.stats().ioc_inits, 1);
}

#[test]
fn silent_controller_times_out_the_reply() {
    let sim = SimIoc::default();
    sim.set_silent(true);
    let err = exchange(&sim, &IocFactsRequest::default().to_bytes()).unwrap_err();
    assert_eq!(err, HandshakeError::ReplyTimeout);
    assert!(!doorbell(&sim).active);
}

#[test]
fn faulted_controller_refuses_handshakes() {
    let sim = SimIoc::default();
    sim.inject_fault(0x1234);

    let db = doorbell(&sim);
    assert_eq!(db.state, IocState::Fault);
    assert_eq!(db.fault_code(), 0x1234);
    assert_eq!(
        exchange(&sim, &IocFactsRequest::default().to_bytes()),
        Err(HandshakeError::NoAck)
    );
}

#[test]
fn requests_before_init_are_ignored() {
    let sim = SimIoc::default();
    sim.write_reg(Register::RequestQueue, 0x1000_0000);
    assert_eq!(sim.stats().ignored_requests, 1);
    assert_eq!(sim.stats().requests, 0);
}

#[test]
fn diagnostic_register_needs_the_write_sequence() {
    let sim = SimIoc::default();
    sim.write_reg(Register::HostDiagnostic, HostDiagnostic::RESET_ADAPTER.bits());
    assert_eq!(sim.stats().hard_resets, 0);
    assert!(!diag(&sim).contains(HostDiagnostic::DRWE));

    // A wrong key part-way through starts over.
    sim.write_reg(Register::WriteSequence, WRITE_SEQUENCE_KEYS[0]);
    sim.write_reg(Register::WriteSequence, WRITE_SEQUENCE_KEYS[2]);
    for key in &WRITE_SEQUENCE_KEYS[1..] {
        sim.write_reg(Register::WriteSequence, *key);
    }
    assert!(!diag(&sim).contains(HostDiagnostic::DRWE));

    unlock(&sim);
    assert!(diag(&sim).contains(HostDiagnostic::DRWE));

    sim.inject_fault(0x0101);
    let reset = diag(&sim) | HostDiagnostic::RESET_ADAPTER;
    sim.write_reg(Register::HostDiagnostic, reset.bits());
    assert_eq!(sim.stats().hard_resets, 1);
    assert_eq!(sim.state(), IocState::Ready);
    let after = diag(&sim);
    assert!(after.contains(HostDiagnostic::RESET_HISTORY));
    assert!(!after.contains(HostDiagnostic::RESET_ADAPTER));

    sim.write_reg(Register::WriteSequence, WRITE_SEQUENCE_LOCK);
    assert!(!diag(&sim).contains(HostDiagnostic::DRWE));
}

#[test]
fn download_boot_checks_the_image() {
    let image: Vec<u8> = (0..64u8).collect();
    let sim = SimIoc::new(SimConfig {
        firmware: Some(image.clone()),
        ..SimConfig::default()
    });
    unlock(&sim);
    let held = diag(&sim) | HostDiagnostic::RESET_ADAPTER | HostDiagnostic::DISABLE_ARM;
    sim.write_reg(Register::HostDiagnostic, held.bits());
    assert_eq!(sim.state(), IocState::Reset);
    assert!(diag(&sim).contains(HostDiagnostic::DISABLE_ARM));

    sim.write_reg(Register::DiagRwAddress, 0);
    for chunk in image.chunks(4) {
        sim.write_reg(
            Register::DiagRwData,
            u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]),
        );
    }
    let release = diag(&sim) - HostDiagnostic::DISABLE_ARM;
    sim.write_reg(Register::HostDiagnostic, release.bits());
    assert_eq!(sim.state(), IocState::Ready);
    assert_eq!(sim.stats().download_boots, 1);

    // Same again with a corrupted image.
    let held = diag(&sim) | HostDiagnostic::RESET_ADAPTER | HostDiagnostic::DISABLE_ARM;
    sim.write_reg(Register::HostDiagnostic, held.bits());
    sim.write_reg(Register::DiagRwAddress, 0);
    sim.write_reg(Register::DiagRwData, 0xdead_beef);
    let release = diag(&sim) - HostDiagnostic::DISABLE_ARM;
    sim.write_reg(Register::HostDiagnostic, release.bits());
    let db = doorbell(&sim);
    assert_eq!(db.state, IocState::Fault);
    assert_eq!(db.fault_code(), FAULT_BAD_IMAGE);
}

#[test]
fn message_unit_reset_keeps_event_state() {
    let sim = SimIoc::default();
    exchange(&sim, &ioc_init()).unwrap();

    let request = sim.alloc_dma(128, 16).unwrap();
    let reply = sim.alloc_dma(80, 16).unwrap();
    sim.write_dma(
        request.bus_addr,
        &EventNotificationRequest {
            switch: true,
            msg_context: 0x0001_0000,
        }
        .to_bytes(),
    );
    sim.write_reg(Register::ReplyQueue, reply.bus_addr as u32);
    sim.write_reg(Register::RequestQueue, request.bus_addr as u32);
    assert_eq!(sim.event_state(), 1);
    assert_eq!(
        ReplyDescriptor::decode(sim.read_reg(Register::ReplyQueue)),
        Ok(ReplyDescriptor::Address {
            frame_addr: reply.bus_addr
        })
    );

    sim.write_reg(
        Register::Doorbell,
        DoorbellFunction::MessageUnitReset.doorbell_word(0),
    );
    assert_eq!(sim.state(), IocState::Ready);
    assert_eq!(sim.event_state(), 1);
    assert_eq!(sim.free_reply_frames(), 0);

    sim.write_reg(Register::Doorbell, DoorbellFunction::IoUnitReset.doorbell_word(0));
    assert_eq!(sim.event_state(), 0);
    assert_eq!(sim.stats().message_unit_resets, 1);
    assert_eq!(sim.stats().io_unit_resets, 1);
}
