// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Processor fault entry points.
//!
//! The application's vector table routes its fault handlers here. Each
//! entry logs the fault with whatever address information the fault
//! status makes trustworthy, then forces the safe state through the
//! state machine's fault path. The returned action is executed by the
//! handler itself (typically: halt and let the watchdog reset).

use abi::SafetyError;
use drv_armv7m_mpu::MemFaultStatus;
use safecore::{SafeAction, SafetyContext, SafetyHooks};

/// Hard fault: stacked MSP/PSP values go into the log params.
pub fn hard_fault(
    ctx: &mut SafetyContext,
    hooks: &mut impl SafetyHooks,
    msp: u32,
    psp: u32,
    now_ms: u64,
) -> SafeAction {
    ctx.handle_fault(hooks, SafetyError::HardFault, msp, psp, now_ms)
}

/// MemManage fault: a region-guard violation. The fault address register
/// is only meaningful when the status byte says so.
pub fn mem_manage(
    ctx: &mut SafetyContext,
    hooks: &mut impl SafetyHooks,
    mmfar: u32,
    cfsr: u32,
    now_ms: u64,
) -> SafeAction {
    let status = MemFaultStatus::from_bits_truncate(cfsr as u8);
    let address = if status.contains(MemFaultStatus::MMARVALID) {
        mmfar
    } else {
        0
    };
    ctx.handle_fault(hooks, SafetyError::MpuFault, address, cfsr, now_ms)
}

pub fn bus_fault(
    ctx: &mut SafetyContext,
    hooks: &mut impl SafetyHooks,
    bfar: u32,
    cfsr: u32,
    now_ms: u64,
) -> SafeAction {
    ctx.handle_fault(hooks, SafetyError::BusFault, bfar, cfsr, now_ms)
}

pub fn usage_fault(
    ctx: &mut SafetyContext,
    hooks: &mut impl SafetyHooks,
    cfsr: u32,
    now_ms: u64,
) -> SafeAction {
    ctx.handle_fault(hooks, SafetyError::UsageFault, 0, cfsr, now_ms)
}

pub fn nmi(
    ctx: &mut SafetyContext,
    hooks: &mut impl SafetyHooks,
    now_ms: u64,
) -> SafeAction {
    ctx.handle_fault(hooks, SafetyError::Nmi, 0, 0, now_ms)
}
