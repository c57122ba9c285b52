//! Message execution: what the firmware does with a handshake or a posted request frame.

use mpt_protocol::header::{FUNCTION_BYTE, MSG_CONTEXT_OFFSET};
use mpt_protocol::sge::{self, SgeFlags};
use mpt_protocol::{
    DefaultReply, EventCode, EventNotificationReply, EventNotificationRequest, Function,
    FwUploadReply, FwUploadRequest, IocFactsReply, IocInitRequest, IocState, IocStatus, MsgContext,
    MsgFlags, PortEnableRequest, PortFactsReply, PortFactsRequest, RaidActionReply,
    RaidActionRequest, ReplyDescriptor, Sge, TaskMgmtReply, TaskMgmtRequest, TurboReply,
};

use crate::controller::SimController;
use crate::IoRecord;

/// Offset of the scatter-gather list in a SCSI I/O request.
const SCSI_IO_SGL_OFFSET: usize = 48;

/// Upper bound on elements walked in one list; a longer list is treated as a loop.
const MAX_SGL_WALK: usize = 4096;

const MSG_VERSION: u16 = 0x0105;
const HEADER_VERSION: u16 = 0x0a00;

fn default_reply(function: u8, msg_context: u32, status: u16) -> Vec<u8> {
    let reply = DefaultReply {
        msg_length: (DefaultReply::SIZE / 4) as u8,
        function,
        msg_flags: MsgFlags::empty(),
        msg_context,
        ioc_status: IocStatus(status),
        log_info: 0,
    };
    reply.to_bytes().to_vec()
}

fn context_of(request: &[u8]) -> u32 {
    request
        .get(MSG_CONTEXT_OFFSET..MSG_CONTEXT_OFFSET + 4)
        .map_or(0, |b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

impl SimController {
    pub(crate) fn facts(&self, msg_context: u32) -> IocFactsReply {
        let config = &self.config;
        let (flags, fw_image_size) = match &config.firmware {
            Some(image) => (IocFactsReply::FLAG_FW_DOWNLOAD_BOOT, image.len() as u32),
            None => (0, 0),
        };
        IocFactsReply {
            msg_version: MSG_VERSION,
            header_version: HEADER_VERSION,
            msg_context,
            max_chain_depth: config.max_chain_depth,
            who_init: self.who_init as u8,
            flags,
            reply_queue_depth: config.reply_queue_depth,
            request_frame_size: config.request_frame_dwords,
            global_credits: config.global_credits,
            number_of_ports: config.ports.len() as u8,
            event_state: self.event_state,
            cur_reply_frame_size: self.reply_frame_size,
            max_devices: 16,
            max_buses: 1,
            fw_image_size,
            fw_version: config.fw_version,
            ..IocFactsReply::default()
        }
    }

    /// Reply to a request received through the doorbell.
    pub(crate) fn handshake_reply(&mut self, function: u8, request: &[u8]) -> Vec<u8> {
        let ctx = context_of(request);
        match Function::from_u8(function) {
            Some(Function::IocFacts) => self.facts(ctx).to_bytes().to_vec(),
            Some(Function::PortFacts) => {
                let port_number = PortFactsRequest::parse(request).map_or(0, |r| r.port_number);
                let reply = match self.config.ports.get(port_number as usize) {
                    Some(&port_type) => PortFactsReply {
                        port_number,
                        msg_context: ctx,
                        port_type,
                        max_devices: 16,
                        port_scsi_id: 7,
                        ..PortFactsReply::default()
                    },
                    None => PortFactsReply {
                        port_number,
                        msg_context: ctx,
                        ioc_status: IocStatus(IocStatus::INVALID_FIELD),
                        ..PortFactsReply::default()
                    },
                };
                reply.to_bytes().to_vec()
            }
            Some(Function::IocInit) => {
                let status = match IocInitRequest::parse(request) {
                    Ok(_) if self.state != IocState::Ready => IocStatus::INVALID_STATE,
                    Ok(init) => {
                        self.stats.ioc_inits += 1;
                        self.who_init = init.who_init;
                        self.reply_frame_size = init.reply_frame_size;
                        self.state = IocState::Operational;
                        IocStatus::SUCCESS
                    }
                    Err(_) => IocStatus::INVALID_FIELD,
                };
                default_reply(function, ctx, status)
            }
            Some(Function::PortEnable) => {
                let status = match PortEnableRequest::parse(request) {
                    Ok(r) if (r.port_number as usize) < self.config.ports.len() => {
                        self.stats.port_enables += 1;
                        IocStatus::SUCCESS
                    }
                    _ => IocStatus::INVALID_FIELD,
                };
                default_reply(function, ctx, status)
            }
            Some(Function::FwUpload) => self.fw_upload(request, ctx),
            _ => default_reply(function, ctx, IocStatus::INVALID_FUNCTION),
        }
    }

    fn fw_upload(&mut self, request: &[u8], ctx: u32) -> Vec<u8> {
        let mut reply = FwUploadReply {
            image_type: FwUploadRequest::IMAGE_TYPE_FW,
            msg_context: ctx,
            ..FwUploadReply::default()
        };
        let parsed = FwUploadRequest::parse(request);
        match (&self.config.firmware, parsed) {
            (Some(image), Ok(req)) => {
                let len = image.len().min(req.image_size as usize);
                let image = image[..len].to_vec();
                self.memory.write(req.buffer.address(), &image);
                self.stats.fw_uploads += 1;
                reply.actual_image_size = if self.fw_size_mismatch {
                    len as u32 + 4
                } else {
                    len as u32
                };
            }
            (None, _) => reply.ioc_status = IocStatus(IocStatus::INVALID_FUNCTION),
            (_, Err(_)) => reply.ioc_status = IocStatus(IocStatus::INVALID_FIELD),
        }
        reply.to_bytes().to_vec()
    }

    /// The host wrote a request frame address to the request FIFO.
    pub(crate) fn post_request(&mut self, frame_addr: u32) {
        if self.state != IocState::Operational {
            tracing::debug!(
                frame_addr = format_args!("{frame_addr:#x}"),
                "sim: request while not operational"
            );
            self.stats.ignored_requests += 1;
            return;
        }
        self.stats.requests += 1;
        if self.drop_requests {
            return;
        }
        if self.hold_requests {
            self.held.push_back(frame_addr);
            return;
        }
        let frame = self.read_frame(frame_addr);
        self.execute(&frame);
    }

    pub(crate) fn release_held(&mut self) -> usize {
        let held: Vec<u32> = self.held.drain(..).collect();
        for &addr in &held {
            let frame = self.read_frame(addr);
            self.execute(&frame);
        }
        held.len()
    }

    fn read_frame(&self, frame_addr: u32) -> Vec<u8> {
        let len = self.config.request_frame_dwords as usize * 4;
        self.memory.read_vec(frame_addr as u64, len)
    }

    /// Executes a request frame and posts its reply.
    pub(crate) fn execute(&mut self, request: &[u8]) {
        let function = request.get(FUNCTION_BYTE).copied().unwrap_or(0xff);
        let ctx = context_of(request);
        let reply = match Function::from_u8(function) {
            Some(Function::ScsiIoRequest) => {
                self.stats.scsi_io += 1;
                let record = self.walk_sgl(request, MsgContext::from_u32(ctx));
                self.last_io = Some(record);
                let turbo = ReplyDescriptor::Turbo(TurboReply::ScsiInitiator {
                    context: MsgContext::from_u32(ctx),
                });
                self.reply_fifo.push_back(turbo.encode());
                return;
            }
            Some(Function::PortEnable) => {
                self.stats.port_enables += 1;
                default_reply(function, ctx, IocStatus::SUCCESS)
            }
            Some(Function::EventNotification) => {
                let switch = EventNotificationRequest::parse(request).map_or(false, |r| r.switch);
                self.stats.event_notifications += 1;
                self.event_state = switch as u8;
                self.event_frame = switch.then_some(ctx);
                EventNotificationReply {
                    ack_required: false,
                    msg_flags: if switch {
                        MsgFlags::CONTINUATION_REPLY
                    } else {
                        MsgFlags::empty()
                    },
                    msg_context: ctx,
                    ioc_status: IocStatus(IocStatus::SUCCESS),
                    log_info: 0,
                    event: EventCode::EventChange as u32,
                    event_context: self.next_event_context(),
                    data: vec![switch as u32],
                }
                .to_bytes()
            }
            Some(Function::EventAck) => {
                self.stats.event_acks += 1;
                default_reply(function, ctx, IocStatus::SUCCESS)
            }
            Some(Function::RaidAction) => match RaidActionRequest::parse(request) {
                Ok(req) => {
                    self.stats.raid_actions += 1;
                    RaidActionReply {
                        action: req.action,
                        volume_id: req.volume_id,
                        volume_bus: req.volume_bus,
                        phys_disk_num: req.phys_disk_num,
                        msg_context: ctx,
                        volume_status: 0x0000_0001,
                        action_data: req.action_data_word,
                        ..RaidActionReply::default()
                    }
                    .to_bytes()
                    .to_vec()
                }
                Err(_) => default_reply(function, ctx, IocStatus::INVALID_FIELD),
            },
            Some(Function::ScsiTaskMgmt) => match TaskMgmtRequest::parse(request) {
                Ok(req) => {
                    self.stats.task_mgmt += 1;
                    TaskMgmtReply {
                        target_id: req.target_id,
                        bus: req.bus,
                        task_type: req.task_type as u8,
                        msg_context: req.msg_context,
                        ..TaskMgmtReply::default()
                    }
                    .to_bytes()
                    .to_vec()
                }
                Err(_) => default_reply(function, ctx, IocStatus::INVALID_FIELD),
            },
            _ => default_reply(function, ctx, IocStatus::INVALID_FUNCTION),
        };
        self.address_reply(&reply);
    }

    fn next_event_context(&mut self) -> u32 {
        self.event_context = self.event_context.wrapping_add(1);
        self.event_context
    }

    /// Copies `reply` into the next free reply frame and queues its descriptor.
    pub(crate) fn address_reply(&mut self, reply: &[u8]) -> bool {
        let Some(frame_addr) = self.reply_free.pop_front() else {
            tracing::warn!("sim: no free reply frame; reply dropped");
            self.stats.dropped_replies += 1;
            return false;
        };
        let len = match self.reply_frame_size {
            0 => reply.len(),
            size => reply.len().min(size as usize),
        };
        self.memory.write(frame_addr as u64, &reply[..len]);
        let descriptor = ReplyDescriptor::Address {
            frame_addr: frame_addr as u64,
        };
        self.reply_fifo.push_back(descriptor.encode());
        true
    }

    pub(crate) fn post_event(&mut self, event: u32, data: &[u32], ack_required: bool) -> bool {
        let Some(ctx) = self.event_frame.filter(|_| self.event_state != 0) else {
            return false;
        };
        if self.state != IocState::Operational {
            return false;
        }
        let reply = EventNotificationReply {
            ack_required,
            msg_flags: MsgFlags::CONTINUATION_REPLY,
            msg_context: ctx,
            ioc_status: IocStatus(IocStatus::SUCCESS),
            log_info: 0,
            event,
            event_context: self.next_event_context(),
            data: data.to_vec(),
        };
        self.address_reply(&reply.to_bytes())
    }

    /// Follows a SCSI I/O request's scatter-gather list through any chain buffers.
    fn walk_sgl(&self, request: &[u8], context: MsgContext) -> IoRecord {
        let mut record = IoRecord {
            context,
            elements: 0,
            bytes: 0,
            chains: 0,
            terminated: false,
        };
        let mut segment = request.to_vec();
        let mut off = SCSI_IO_SGL_OFFSET;
        for _ in 0..MAX_SGL_WALK {
            let Some(buf) = segment.get(off..) else {
                break;
            };
            let Ok(element) = sge::decode(buf) else {
                break;
            };
            let size = if buf[3] & SgeFlags::ADDRESS_64.bits() != 0 { 12 } else { 8 };
            match element {
                Sge::Chain {
                    length, address, ..
                } => {
                    record.chains += 1;
                    segment = self.memory.read_vec(address, length as usize);
                    off = 0;
                }
                Sge::Simple { flags, length, .. } => {
                    if length > 0 {
                        record.elements += 1;
                        record.bytes += length as u64;
                    }
                    if flags.contains(SgeFlags::END_OF_LIST) {
                        record.terminated = true;
                        break;
                    }
                    off += size;
                }
            }
        }
        record
    }
}
