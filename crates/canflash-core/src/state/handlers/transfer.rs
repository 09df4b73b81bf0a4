//! Transfer handlers (begin update, chunk loop).

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info, instrument, warn};

use crate::error::UpdateError;
use crate::events::{UpdateEvent, UpdateObserver};
use crate::payload::sequence_for;
use crate::protocol::constants::*;
use crate::protocol::{BootloaderStatus, DeviceError, describe_status};
use crate::transport::CanTransport;

use super::HandlerContext;

/// Announce the image size and wait for the device to prepare its bank.
pub fn begin<T: CanTransport, O: UpdateObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<(), UpdateError> {
    let mut size = [0u8; 4];
    LittleEndian::write_u32(&mut size, ctx.state.total_size as u32);

    let waiter = ctx.expect(&[RSP_BEGIN]);
    ctx.send(CMD_BEGIN_UPDATE, &size)?;
    ctx.arm(ctx.config.begin_timeout_ms);

    let msg = ctx.wait(&waiter, "begin response")?;
    let Some(&raw) = msg.payload().first().filter(|_| msg.id() == RSP_BEGIN) else {
        return Err(ctx.unexpected(&msg));
    };

    let status = ctx.state.set_device_status(raw);
    if status != Some(BootloaderStatus::InProgress) {
        if let Some(status) = status {
            ctx.set_status(status);
        }
        return Err(UpdateError::Rejected {
            status: raw,
            description: describe_status(raw),
        });
    }
    ctx.set_status(BootloaderStatus::InProgress);

    ctx.state.target_bank = msg.payload().get(1).copied();
    info!(
        size = ctx.state.total_size,
        chunks = ctx.state.total_chunks,
        target_bank = ?ctx.state.target_bank,
        "Update accepted"
    );
    Ok(())
}

/// Send every chunk, resending on sequence mismatch.
#[instrument(skip_all)]
pub fn send_chunks<T: CanTransport, O: UpdateObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<(), UpdateError> {
    let max_retries = ctx.config.max_chunk_retries;
    let waiter = ctx.expect(&[RSP_PROGRESS]);

    for index in 0..ctx.state.total_chunks {
        ctx.check_cancel()?;

        let sequence = sequence_for(index);
        let Some(payload) = ctx.state.image.as_ref().map(|img| img.chunk_payload(index)) else {
            break;
        };
        let data_len = payload.len() - 1;
        ctx.state.start_chunk(index, sequence);

        ctx.send(CMD_DATA, &payload)?;
        ctx.arm(ctx.config.chunk_timeout_ms);

        loop {
            let msg = ctx.wait(&waiter, "chunk acknowledgement")?;
            match msg.id() {
                RSP_PROGRESS => {
                    let p = msg.payload();
                    if let Some(&acked) = p.first()
                        && acked != sequence
                    {
                        debug!(acked, expected = sequence, "Ignoring stale acknowledgement");
                        continue;
                    }

                    ctx.state.acknowledge(data_len);
                    if p.len() >= 5 {
                        let device_bytes = LittleEndian::read_u32(&p[1..5]) as u64;
                        if device_bytes != ctx.state.bytes_acknowledged {
                            warn!(
                                device = device_bytes,
                                host = ctx.state.bytes_acknowledged,
                                "Byte count disagrees with device"
                            );
                        }
                    }

                    ctx.emit(UpdateEvent::Progress {
                        acknowledged: ctx.state.bytes_acknowledged,
                        total: ctx.state.total_size,
                        fraction: ctx.state.progress(),
                    });
                    break;
                }
                ERR_SEQUENCE_MISMATCH => {
                    let diagnostic = DeviceError::decode(msg.id(), msg.payload())
                        .map(|e| e.to_string())
                        .unwrap_or_default();

                    if !ctx.state.record_retry(max_retries) {
                        return Err(UpdateError::RetriesExhausted {
                            chunk: index,
                            sequence,
                            attempts: ctx.state.retries,
                            last: diagnostic,
                        });
                    }

                    ctx.emit(UpdateEvent::Retry {
                        chunk: index,
                        sequence,
                        attempt: ctx.state.retries,
                        max: max_retries,
                        diagnostic,
                    });
                    ctx.send(CMD_DATA, &payload)?;
                    ctx.arm(ctx.config.chunk_timeout_ms);
                }
                _ => return Err(ctx.unexpected(&msg)),
            }
        }
    }

    info!(
        bytes = ctx.state.bytes_acknowledged,
        retries = ctx.state.total_retries,
        "All chunks acknowledged"
    );
    Ok(())
}
