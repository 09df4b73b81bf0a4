//! Handshake handlers (enter bootloader, boot info, ping).

use tracing::{debug, info};

use crate::error::UpdateError;
use crate::events::{LogLevel, UpdateEvent, UpdateObserver};
use crate::protocol::constants::*;
use crate::protocol::{BootloaderStatus, describe_status};
use crate::transport::CanTransport;

use super::HandlerContext;

/// Switch the device into its bootloader and let it settle.
pub fn enter_bootloader<T: CanTransport, O: UpdateObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<(), UpdateError> {
    info!("Requesting bootloader mode");
    ctx.send(CMD_ENTER_BOOTLOADER, &[])?;
    ctx.pause(ctx.config.enter_delay())
}

/// Rebuild the boot info from the device's query records.
pub fn query_info<T: CanTransport, O: UpdateObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<(), UpdateError> {
    let waiter = ctx.expect(&[RSP_QUERY]);
    ctx.send(CMD_QUERY_INFO, &[])?;
    ctx.arm(ctx.config.query_timeout_ms);

    let mut records = 0usize;
    loop {
        let msg = ctx.wait(&waiter, "boot info")?;
        if msg.id() != RSP_QUERY {
            return Err(ctx.unexpected(&msg));
        }
        records += 1;
        if ctx.boot_info.apply_record(msg.payload())? {
            break;
        }
    }

    debug!(records, "Boot info complete");
    ctx.emit(UpdateEvent::BootInfo(ctx.boot_info.clone()));
    if let Some(status) = ctx.boot_info.status() {
        ctx.set_status(status);
    }
    Ok(())
}

/// Ask the device for its status byte.
pub fn read_status<T: CanTransport, O: UpdateObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<u8, UpdateError> {
    let waiter = ctx.expect(&[RSP_PING]);
    ctx.send(CMD_PING, &[])?;
    ctx.arm(ctx.config.ping_timeout_ms);

    let msg = ctx.wait(&waiter, "ping response")?;
    let Some(&raw) = msg.payload().first().filter(|_| msg.id() == RSP_PING) else {
        return Err(ctx.unexpected(&msg));
    };

    if let Some(status) = ctx.state.set_device_status(raw) {
        ctx.set_status(status);
    }
    Ok(raw)
}

/// Confirm the device accepts new work.
pub fn ping<T: CanTransport, O: UpdateObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<(), UpdateError> {
    let raw = read_status(ctx)?;
    if BootloaderStatus::from_u8(raw) != Some(BootloaderStatus::Ready) {
        return Err(UpdateError::NotReady {
            status: raw,
            description: describe_status(raw),
        });
    }
    ctx.log(LogLevel::Info, "Bootloader ready");
    Ok(())
}
