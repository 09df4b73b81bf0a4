//! Finish handlers (end update, verification).

use byteorder::{ByteOrder, LittleEndian};
use tracing::{info, warn};

use crate::error::UpdateError;
use crate::events::{UpdateEvent, UpdateObserver};
use crate::protocol::constants::*;
use crate::protocol::{BootloaderStatus, CanMessage, describe_status};
use crate::transport::CanTransport;

use super::HandlerContext;

/// Send the image CRC32 and wait for the device's verdict.
pub fn end_update<T: CanTransport, O: UpdateObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<CanMessage, UpdateError> {
    let mut crc = [0u8; 4];
    LittleEndian::write_u32(&mut crc, ctx.state.crc32);

    let waiter = ctx.expect(&[RSP_END]);
    ctx.send(CMD_END_UPDATE, &crc)?;
    ctx.arm(ctx.config.end_timeout_ms);

    let msg = ctx.wait(&waiter, "end response")?;
    if msg.id() != RSP_END || msg.payload().is_empty() {
        return Err(ctx.unexpected(&msg));
    }
    Ok(msg)
}

/// Evaluate the end response and fold it into the boot info.
pub fn verify<T: CanTransport, O: UpdateObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
    response: &CanMessage,
) -> Result<(), UpdateError> {
    let p = response.payload();
    ctx.boot_info.apply_end_response(p);
    ctx.emit(UpdateEvent::BootInfo(ctx.boot_info.clone()));

    let Some(&raw) = p.first() else {
        return Err(ctx.unexpected(response));
    };
    let status = ctx.state.set_device_status(raw);
    if let Some(status) = status {
        ctx.set_status(status);
    }

    if status != Some(BootloaderStatus::Success) {
        return Err(UpdateError::VerificationFailed {
            status: raw,
            description: describe_status(raw),
        });
    }

    if p.len() >= 6 {
        let device_crc = LittleEndian::read_u32(&p[2..6]);
        if device_crc != ctx.state.crc32 {
            warn!(
                device = %format!("0x{:08X}", device_crc),
                host = %format!("0x{:08X}", ctx.state.crc32),
                "Device reported success with a different CRC32"
            );
        }
    }

    ctx.check_cancel()?;
    info!(bank = ?p.get(1), crc = %format!("0x{:08X}", ctx.state.crc32), "Firmware verified");
    Ok(())
}
