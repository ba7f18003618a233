// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

//! Hypercall opcodes and entry points.
//!
//! The exit dispatcher decodes a vmcall, maps the guest-virtual argument
//! buffer into VMM space for the duration of the call, and routes here. All
//! entry points return the value for the guest's result register.

use alloc::sync::Arc;
use hyp_console::println;

use crate::domain::{get_dom, Domain, DomainTable};
use crate::gnttab::AddToPhysmap;
use crate::hvm;
use crate::vcpu::{Vcpu, VcpuKind};

pub const EINVAL: i64 = 22;
pub const ESRCH: i64 = 3;
pub const ENOSYS: i64 = 38;

// Stable hypercall numbers.
pub const HYPERVISOR_MEMORY_OP: u64 = 12;
pub const HYPERVISOR_GRANT_TABLE_OP: u64 = 20;
pub const HYPERVISOR_HVM_OP: u64 = 34;

// Grant-table sub-operations.
pub const GNTTABOP_MAP_GRANT_REF: u32 = 0;
pub const GNTTABOP_UNMAP_GRANT_REF: u32 = 1;
pub const GNTTABOP_COPY: u32 = 5;
pub const GNTTABOP_QUERY_SIZE: u32 = 6;
pub const GNTTABOP_SET_VERSION: u32 = 8;

// HVM sub-operations.
pub const HVMOP_SET_PARAM: u32 = 0;
pub const HVMOP_GET_PARAM: u32 = 1;
pub const HVMOP_PAGETABLE_DYING: u32 = 9;
pub const HVMOP_SET_EVTCHN_UPCALL_VECTOR: u32 = 23;

// Memory sub-operations.
pub const XENMEM_ADD_TO_PHYSMAP: u32 = 7;
/// `AddToPhysmap.space` value selecting the grant table.
pub const XENMAPSPACE_GRANT_TABLE: u32 = 1;

// Vendor-specific vCPU operations, carried in their own opcode space.
pub const VCPU_OP_CREATE_VCPU: u64 = 0xbf5c_0001;
pub const VCPU_OP_KILL_VCPU: u64 = 0xbf5c_0002;
pub const VCPU_OP_DESTROY_VCPU: u64 = 0xbf5c_0003;
pub const VCPU_OP_START_VMEXIT_TRACE: u64 = 0xbf5c_0004;
pub const VCPU_OP_STOP_VMEXIT_TRACE: u64 = 0xbf5c_0005;
pub const VCPU_OP_DUMP_KERNEL_FAULT: u64 = 0xbf5c_0006;

/// The execution context of an in-flight hypercall: the issuing vCPU, its
/// domain, and the registry for foreign lookups.
pub struct HypercallCtx<'a> {
    pub domains: &'a DomainTable,
    pub dom: Arc<Domain>,
    pub vcpu: Arc<Vcpu>,
}

/// `HVMOP_set_param` / `HVMOP_get_param` argument layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct HvmParamReq {
    pub domid: u16,
    pub _pad: u16,
    pub index: u32,
    pub value: u64,
}

/// `HVMOP_set_evtchn_upcall_vector` argument layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct EvtchnUpcallVector {
    pub vcpu: u32,
    pub vector: u8,
}

fn hvm_errno(e: hvm::Error) -> i64 {
    match e {
        hvm::Error::IndexOutOfRange(_)
        | hvm::Error::UnknownParam(_)
        | hvm::Error::BadValue
        | hvm::Error::UnsupportedCallbackType(_)
        | hvm::Error::NotPermitted(_) => -EINVAL,
    }
}

/// `HVMOP_set_param`.
pub fn hvm_set_param(ctx: &HypercallCtx, req: &mut HvmParamReq) -> i64 {
    let Some(dom) = get_dom(ctx.domains, &ctx.dom, req.domid) else {
        println!("hvm: set_param: domid 0x{:x} not found", req.domid);
        return -ESRCH;
    };
    match hvm::set_param(&dom, req.index, req.value) {
        Ok(()) => 0,
        Err(e) => hvm_errno(e),
    }
}

/// `HVMOP_get_param`.
pub fn hvm_get_param(ctx: &HypercallCtx, req: &mut HvmParamReq) -> i64 {
    let Some(dom) = get_dom(ctx.domains, &ctx.dom, req.domid) else {
        println!("hvm: get_param: domid 0x{:x} not found", req.domid);
        return -ESRCH;
    };
    let result = match ctx.vcpu.kind() {
        VcpuKind::Guest => hvm::get_param_guest(&dom, req.index),
        VcpuKind::Root => {
            if !ctx.dom.is_root() || !dom.is_root() {
                return -EINVAL;
            }
            hvm::get_param_root(&dom, req.index)
        }
    };
    match result {
        Ok(value) => {
            req.value = value;
            0
        }
        Err(e) => hvm_errno(e),
    }
}

/// `HVMOP_pagetable_dying` is not implemented.
pub fn hvm_pagetable_dying(_ctx: &HypercallCtx) -> i64 {
    -ENOSYS
}

/// `HVMOP_set_evtchn_upcall_vector`.
pub fn hvm_set_evtchn_upcall_vector(ctx: &HypercallCtx, req: &EvtchnUpcallVector) -> i64 {
    if req.vcpu == ctx.vcpu.id() {
        ctx.vcpu.set_upcall_vector(req.vector);
        return 0;
    }
    let Some(vcpu) = ctx.dom.get_vcpu(req.vcpu) else {
        println!("hvm: vcpu {} not found", req.vcpu);
        return -ESRCH;
    };
    vcpu.set_upcall_vector(req.vector);
    0
}

/// `XENMEM_add_to_physmap`. Only the grant-table space is populated this
/// way.
pub fn add_to_physmap(ctx: &HypercallCtx, atp: &mut AddToPhysmap) -> i64 {
    if atp.space != XENMAPSPACE_GRANT_TABLE {
        println!("memory: add_to_physmap space {} unsupported", atp.space);
        return -ENOSYS;
    }
    crate::gnttab::mapspace_grant_table(ctx, atp)
}

fn create_vcpu(ctx: &HypercallCtx, domid: u16) -> i64 {
    let Some(dom) = get_dom(ctx.domains, &ctx.dom, domid) else {
        return -ESRCH;
    };
    // Ids are assigned densely; vCPUs of dead guests are destroyed with
    // their domain, not recycled into it.
    let id = dom.nr_vcpus() as u32;
    let vcpu = Vcpu::new(id, &dom.arc(), VcpuKind::Guest, None);
    match dom.add_vcpu(vcpu) {
        Ok(()) => id as i64,
        Err(e) => {
            println!("vcpu_op: create failed: {:?}", e);
            -EINVAL
        }
    }
}

fn kill_vcpu(ctx: &HypercallCtx, domid: u16, vcpuid: u32) -> i64 {
    let Some(dom) = get_dom(ctx.domains, &ctx.dom, domid) else {
        return -ESRCH;
    };
    let Some(vcpu) = dom.get_vcpu(vcpuid) else {
        return -ESRCH;
    };
    vcpu.kill();
    0
}

fn destroy_vcpu(ctx: &HypercallCtx, domid: u16, vcpuid: u32) -> i64 {
    let Some(dom) = get_dom(ctx.domains, &ctx.dom, domid) else {
        return -ESRCH;
    };
    match dom.remove_vcpu(vcpuid) {
        Ok(()) => 0,
        Err(e) => {
            println!("vcpu_op: destroy failed: {:?}", e);
            -EINVAL
        }
    }
}

fn dump_kernel_fault(ctx: &HypercallCtx) -> i64 {
    println!("FATAL SEGFAULT FROM GUEST: dom 0x{:x}", ctx.dom.id().bits());
    // Stop tracing before walking the ring so the dump itself stays out of
    // it.
    ctx.vcpu.trace().set_enabled(false);
    ctx.vcpu.trace().dump();
    0
}

/// Dispatches the vendor vCPU opcode space. `arg0`/`arg1` carry the target
/// domain and vCPU ids where an opcode needs them.
pub fn vcpu_op(ctx: &HypercallCtx, opcode: u64, arg0: u64, arg1: u64) -> i64 {
    match opcode {
        VCPU_OP_CREATE_VCPU => create_vcpu(ctx, arg0 as u16),
        VCPU_OP_KILL_VCPU => kill_vcpu(ctx, arg0 as u16, arg1 as u32),
        VCPU_OP_DESTROY_VCPU => destroy_vcpu(ctx, arg0 as u16, arg1 as u32),
        VCPU_OP_START_VMEXIT_TRACE => {
            ctx.vcpu.trace().set_enabled(true);
            0
        }
        VCPU_OP_STOP_VMEXIT_TRACE => {
            ctx.vcpu.trace().set_enabled(false);
            0
        }
        VCPU_OP_DUMP_KERNEL_FAULT => dump_kernel_fault(ctx),
        _ => {
            println!("vcpu_op: unknown opcode 0x{:x}", opcode);
            -ENOSYS
        }
    }
}
