//! Firmware upload for controllers that boot from host memory.
//!
//! Such a controller loses its image on every hard reset. On the first bring-up the engine asks
//! for a copy of the running image and keeps it; later hard resets push it back (see
//! `reset.rs`).

use std::sync::Arc;

use mpt_protocol::sge::TERMINATOR_FLAGS;
use mpt_protocol::{FwUploadReply, FwUploadRequest, IocFactsReply, Sge};

use crate::error::BringUpError;
use crate::ioc::{Ioc, Queues};
use crate::sync::lock;

const STEP: &str = "firmware upload";

impl Ioc {
    pub(crate) fn upload_firmware(&self, facts: &IocFactsReply, q: &Queues) -> Result<(), BringUpError> {
        let size = facts.fw_image_size;
        if size == 0 {
            tracing::warn!(ioc = %self.name, "controller boots from host memory but reports no image size");
            return Ok(());
        }

        let buffer = self.hw.alloc_dma(size as usize, 16)?;
        let request = FwUploadRequest {
            image_type: FwUploadRequest::IMAGE_TYPE_FW,
            msg_context: 0,
            image_offset: 0,
            image_size: size,
            buffer: Sge::simple(TERMINATOR_FLAGS, size, buffer.bus_addr),
        };
        let mut bytes = vec![0u8; FwUploadRequest::encoded_len(q.width)];
        request
            .write(&mut bytes, q.width)
            .map_err(|source| BringUpError::Decode { step: STEP, source })?;

        let mut raw = [0u8; FwUploadReply::SIZE];
        let n = self
            .handshake
            .exchange(
                self.hw.as_ref(),
                &bytes,
                &mut raw,
                self.config.fw_upload_timeout(),
            )
            .map_err(|source| BringUpError::Handshake { step: STEP, source })?;
        let reply = FwUploadReply::parse(&raw[..n])
            .map_err(|source| BringUpError::Decode { step: STEP, source })?;
        if !reply.ioc_status.is_success() {
            return Err(BringUpError::Status {
                step: STEP,
                status: reply.ioc_status,
                log_info: reply.log_info,
            });
        }
        if reply.actual_image_size != size {
            return Err(BringUpError::FirmwareSizeMismatch {
                expected: size,
                actual: reply.actual_image_size,
            });
        }

        let mut image = vec![0u8; size as usize];
        self.hw.read_dma(buffer.bus_addr, &mut image);
        tracing::info!(ioc = %self.name, bytes = size, "firmware image cached");
        *lock(&self.firmware) = Some(Arc::from(image));
        Ok(())
    }
}
