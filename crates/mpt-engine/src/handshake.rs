//! Doorbell handshake: a synchronous request/reply exchange through the doorbell register.
//!
//! The handshake works before the message queues exist, so bring-up uses it for facts, init and
//! port enable. The host announces a request of N dwords, writes them one at a time waiting for
//! the controller to consume each, then reads the reply back sixteen bits per doorbell interrupt.
//!
//! Only one exchange may be in flight per controller; later callers block on the mutex. A failed
//! exchange is reported and never retried here.

use std::sync::Mutex;
use std::time::Duration;

use mpt_protocol::header::{FUNCTION_BYTE, MSG_LENGTH_BYTE};
use mpt_protocol::regs::{HostInterruptStatus, DOORBELL_ACTIVE, DOORBELL_DATA_MASK};
use mpt_protocol::{DoorbellFunction, Register};

use crate::error::HandshakeError;
use crate::hw::Hardware;
use crate::poll::poll_until;
use crate::sync::lock;

/// Largest request the doorbell can announce.
pub const MAX_REQUEST_DWORDS: usize = 255;

/// Smallest sensible reply: a bare header is three dwords.
const MIN_REPLY_DWORDS: u8 = 3;

pub struct Handshake {
    name: String,
    ack_timeout: Duration,
    poll_interval: Duration,
    flight: Mutex<()>,
}

impl Handshake {
    pub fn new(name: impl Into<String>, ack_timeout: Duration, poll_interval: Duration) -> Self {
        Handshake {
            name: name.into(),
            ack_timeout,
            poll_interval,
            flight: Mutex::new(()),
        }
    }

    /// Sends `request` and reads the reply into `reply`. Returns the number of reply bytes
    /// copied, which is the reply's declared length capped at `reply.len()`.
    pub fn exchange(
        &self,
        hw: &dyn Hardware,
        request: &[u8],
        reply: &mut [u8],
        reply_timeout: Duration,
    ) -> Result<usize, HandshakeError> {
        let _flight = lock(&self.flight);
        self.send(hw, request)?;
        let copied = self.read_reply(hw, reply, reply_timeout)?;

        let expected = request[FUNCTION_BYTE];
        let found = reply.get(FUNCTION_BYTE).copied().unwrap_or(expected);
        if found != expected {
            tracing::warn!(ioc = %self.name, expected, found, "handshake reply function mismatch");
            return Err(HandshakeError::FunctionMismatch { expected, found });
        }
        tracing::trace!(ioc = %self.name, function = expected, copied, "handshake complete");
        Ok(copied)
    }

    /// Sends `request` without reading a reply through the doorbell. Used for requests whose
    /// reply comes back through the reply FIFO.
    pub fn send_only(&self, hw: &dyn Hardware, request: &[u8]) -> Result<(), HandshakeError> {
        let _flight = lock(&self.flight);
        self.send(hw, request)?;
        let done = self.wait_int(hw, self.ack_timeout);
        clear_int(hw);
        if !done {
            return Err(HandshakeError::NoAck);
        }
        tracing::trace!(ioc = %self.name, function = request[FUNCTION_BYTE], "handshake request sent");
        Ok(())
    }

    fn send(&self, hw: &dyn Hardware, request: &[u8]) -> Result<(), HandshakeError> {
        let dwords = request.len() / 4;
        if request.len() % 4 != 0 || request.len() <= FUNCTION_BYTE || dwords > MAX_REQUEST_DWORDS {
            return Err(HandshakeError::BadRequestLength { len: request.len() });
        }
        if hw.read_reg(Register::Doorbell) & DOORBELL_ACTIVE != 0 {
            return Err(HandshakeError::DoorbellBusy);
        }

        tracing::debug!(ioc = %self.name, function = request[FUNCTION_BYTE], dwords, "handshake start");
        clear_int(hw);
        hw.write_reg(
            Register::Doorbell,
            DoorbellFunction::Handshake.doorbell_word(dwords as u8),
        );
        if !self.wait_int(hw, self.ack_timeout) {
            return Err(HandshakeError::NoAck);
        }
        if hw.read_reg(Register::Doorbell) & DOORBELL_ACTIVE == 0 {
            return Err(HandshakeError::NoAck);
        }
        clear_int(hw);
        if !self.wait_ack(hw) {
            return Err(HandshakeError::NoAck);
        }

        for (word, chunk) in request.chunks_exact(4).enumerate() {
            let value = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            hw.write_reg(Register::Doorbell, value);
            if !self.wait_ack(hw) {
                tracing::warn!(ioc = %self.name, word, "handshake ack lost");
                return Err(HandshakeError::AckLost { word });
            }
        }
        Ok(())
    }

    fn read_reply(
        &self,
        hw: &dyn Hardware,
        reply: &mut [u8],
        reply_timeout: Duration,
    ) -> Result<usize, HandshakeError> {
        let mut header = [0u8; 4];
        let first = self.read_word(hw, reply_timeout)?;
        let second = self.read_word(hw, self.ack_timeout)?;
        header[..2].copy_from_slice(&first.to_le_bytes());
        header[2..].copy_from_slice(&second.to_le_bytes());

        let dwords = header[MSG_LENGTH_BYTE];
        if dwords < MIN_REPLY_DWORDS {
            return Err(HandshakeError::BadReplyLength { dwords });
        }
        let total = dwords as usize * 4;
        let copied = total.min(reply.len());
        reply[..copied.min(4)].copy_from_slice(&header[..copied.min(4)]);

        for word in 2..total / 2 {
            let value = self.read_word(hw, self.ack_timeout)?;
            let at = word * 2;
            if at + 2 <= copied {
                reply[at..at + 2].copy_from_slice(&value.to_le_bytes());
            }
        }

        if !self.wait_int(hw, self.ack_timeout) {
            return Err(HandshakeError::ReplyTimeout);
        }
        clear_int(hw);
        Ok(copied)
    }

    fn read_word(&self, hw: &dyn Hardware, bound: Duration) -> Result<u16, HandshakeError> {
        if !self.wait_int(hw, bound) {
            return Err(HandshakeError::ReplyTimeout);
        }
        let value = (hw.read_reg(Register::Doorbell) & DOORBELL_DATA_MASK) as u16;
        clear_int(hw);
        Ok(value)
    }

    fn wait_int(&self, hw: &dyn Hardware, bound: Duration) -> bool {
        poll_until(self.poll_interval, bound, || {
            his(hw)
                .contains(HostInterruptStatus::DOORBELL_INTERRUPT)
                .then_some(())
        })
        .is_ok()
    }

    fn wait_ack(&self, hw: &dyn Hardware) -> bool {
        poll_until(self.poll_interval, self.ack_timeout, || {
            (!his(hw).contains(HostInterruptStatus::IOP_DOORBELL_STATUS)).then_some(())
        })
        .is_ok()
    }
}

fn his(hw: &dyn Hardware) -> HostInterruptStatus {
    HostInterruptStatus::from_bits_retain(hw.read_reg(Register::HostInterruptStatus))
}

fn clear_int(hw: &dyn Hardware) {
    hw.write_reg(Register::HostInterruptStatus, 0);
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Instant;

    use mpt_protocol::{DefaultReply, Function, IocFactsRequest, IocStatus};

    use super::*;
    use crate::error::DmaError;
    use crate::hw::DmaRegion;

    #[derive(Default)]
    enum Phase {
        #[default]
        Idle,
        Started,
        Receiving(usize),
        Replying,
        Final,
    }

    /// Doorbell that answers every handshake with a canned reply.
    #[derive(Default)]
    struct FakeDoorbell {
        state: Mutex<FakeState>,
    }

    #[derive(Default)]
    struct FakeState {
        phase: Phase,
        active: bool,
        int: bool,
        received: Vec<u32>,
        reply: Vec<u8>,
        words: VecDeque<u16>,
        silent: bool,
        send_only: bool,
    }

    impl FakeDoorbell {
        fn answering(reply: &[u8]) -> Self {
            let fake = FakeDoorbell::default();
            lock(&fake.state).reply = reply.to_vec();
            fake
        }
    }

    impl Hardware for FakeDoorbell {
        fn read_reg(&self, reg: Register) -> u32 {
            let st = lock(&self.state);
            match reg {
                Register::Doorbell => {
                    let mut v = 0x1000_0000;
                    if st.active {
                        v |= DOORBELL_ACTIVE;
                    }
                    v | st.words.front().copied().unwrap_or(0) as u32
                }
                Register::HostInterruptStatus => {
                    if st.int {
                        HostInterruptStatus::DOORBELL_INTERRUPT.bits()
                    } else {
                        0
                    }
                }
                _ => 0,
            }
        }

        fn write_reg(&self, reg: Register, value: u32) {
            let mut st = lock(&self.state);
            match reg {
                Register::Doorbell => match st.phase {
                    Phase::Idle => {
                        st.phase = Phase::Started;
                        st.active = true;
                        st.int = true;
                    }
                    Phase::Receiving(left) => {
                        st.received.push(value);
                        if left > 1 {
                            st.phase = Phase::Receiving(left - 1);
                        } else if st.send_only {
                            st.phase = Phase::Final;
                            st.int = true;
                        } else if !st.silent {
                            st.words = st
                                .reply
                                .chunks_exact(2)
                                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                                .collect();
                            st.phase = Phase::Replying;
                            st.int = true;
                        }
                    }
                    _ => {}
                },
                Register::HostInterruptStatus => {
                    st.int = false;
                    match st.phase {
                        Phase::Started => st.phase = Phase::Receiving(IocFactsRequest::SIZE / 4),
                        Phase::Replying => {
                            st.words.pop_front();
                            if st.words.is_empty() {
                                st.phase = Phase::Final;
                            }
                            st.int = true;
                        }
                        Phase::Final => {
                            st.phase = Phase::Idle;
                            st.active = false;
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        fn alloc_dma(&self, len: usize, _align: usize) -> Result<DmaRegion, DmaError> {
            Err(DmaError::OutOfMemory { len })
        }

        fn write_dma(&self, _addr: u64, _data: &[u8]) {}

        fn read_dma(&self, _addr: u64, _buf: &mut [u8]) {}
    }

    fn handshake() -> Handshake {
        Handshake::new("hs0", Duration::from_millis(50), Duration::from_millis(1))
    }

    fn facts_request() -> [u8; IocFactsRequest::SIZE] {
        IocFactsRequest { msg_context: 0 }.to_bytes()
    }

    #[test]
    fn exchange_sends_every_dword_and_reads_the_reply() {
        let reply = DefaultReply::new(Function::IocFacts, 0x1234, IocStatus::from_code(0)).to_bytes();
        let hw = FakeDoorbell::answering(&reply);
        let mut buf = [0u8; 64];
        let n = handshake()
            .exchange(&hw, &facts_request(), &mut buf, Duration::from_millis(50))
            .unwrap();
        assert_eq!(n, DefaultReply::SIZE);
        assert_eq!(&buf[..n], &reply[..]);

        let st = lock(&hw.state);
        assert_eq!(st.received.len(), 3);
        assert!(!st.active);
    }

    #[test]
    fn short_buffer_gets_a_prefix() {
        let reply = DefaultReply::new(Function::IocFacts, 0x1234, IocStatus::from_code(0)).to_bytes();
        let hw = FakeDoorbell::answering(&reply);
        let mut buf = [0u8; 12];
        let n = handshake()
            .exchange(&hw, &facts_request(), &mut buf, Duration::from_millis(50))
            .unwrap();
        assert_eq!(n, 12);
        assert_eq!(&buf[..], &reply[..12]);
        assert!(!lock(&hw.state).active, "remaining words must be drained");
    }

    #[test]
    fn mismatched_function_is_reported() {
        let reply = DefaultReply::new(Function::PortFacts, 0, IocStatus::from_code(0)).to_bytes();
        let hw = FakeDoorbell::answering(&reply);
        let mut buf = [0u8; 64];
        assert_eq!(
            handshake().exchange(&hw, &facts_request(), &mut buf, Duration::from_millis(50)),
            Err(HandshakeError::FunctionMismatch {
                expected: Function::IocFacts as u8,
                found: Function::PortFacts as u8,
            })
        );
    }

    #[test]
    fn busy_doorbell_is_refused() {
        let hw = FakeDoorbell::default();
        lock(&hw.state).active = true;
        let mut buf = [0u8; 64];
        assert_eq!(
            handshake().exchange(&hw, &facts_request(), &mut buf, Duration::from_millis(50)),
            Err(HandshakeError::DoorbellBusy)
        );
    }

    #[test]
    fn request_must_be_whole_dwords() {
        let hw = FakeDoorbell::default();
        let mut buf = [0u8; 64];
        assert_eq!(
            handshake().exchange(&hw, &[0u8; 6], &mut buf, Duration::from_millis(50)),
            Err(HandshakeError::BadRequestLength { len: 6 })
        );
        assert!(lock(&hw.state).received.is_empty());
    }

    #[test]
    fn silent_controller_times_out_within_bound() {
        let hw = FakeDoorbell::default();
        lock(&hw.state).silent = true;
        let mut buf = [0u8; 64];
        let start = Instant::now();
        assert_eq!(
            handshake().exchange(&hw, &facts_request(), &mut buf, Duration::from_millis(40)),
            Err(HandshakeError::ReplyTimeout)
        );
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn send_only_waits_for_the_final_interrupt() {
        let hw = FakeDoorbell::default();
        lock(&hw.state).send_only = true;
        handshake().send_only(&hw, &facts_request()).unwrap();
        let st = lock(&hw.state);
        assert_eq!(st.received.len(), 3);
        assert!(!st.active);
    }

    fn dwords(request: &[u8]) -> Vec<u32> {
        request
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    proptest::proptest! {
        #![proptest_config(proptest::prelude::ProptestConfig {
            cases: 16,
            .. proptest::prelude::ProptestConfig::default()
        })]

        /// Each exchange's request dwords reach the doorbell as one uninterrupted run, however
        /// many callers share the handshake.
        #[test]
        fn concurrent_exchanges_never_interleave(callers in 2u32..5, rounds in 1usize..5) {
            let reply =
                DefaultReply::new(Function::IocFacts, 0, IocStatus::from_code(0)).to_bytes();
            let hw = FakeDoorbell::answering(&reply);
            let hs = handshake();

            std::thread::scope(|scope| {
                for tag in 0..callers {
                    let (hw, hs) = (&hw, &hs);
                    scope.spawn(move || {
                        let request = IocFactsRequest { msg_context: tag }.to_bytes();
                        for _ in 0..rounds {
                            let mut buf = [0u8; 64];
                            hs.exchange(hw, &request, &mut buf, Duration::from_secs(2))
                                .unwrap();
                        }
                    });
                }
            });

            let st = lock(&hw.state);
            proptest::prop_assert_eq!(st.received.len(), callers as usize * rounds * 3);
            let mut per_caller = vec![0usize; callers as usize];
            for run in st.received.chunks_exact(3) {
                let tag = run[2];
                proptest::prop_assert!(tag < callers);
                let expected = dwords(&IocFactsRequest { msg_context: tag }.to_bytes());
                proptest::prop_assert_eq!(run, &expected[..]);
                per_caller[tag as usize] += 1;
            }
            proptest::prop_assert!(per_caller.iter().all(|&n| n == rounds));
            proptest::prop_assert!(!st.active);
        }
    }
}
