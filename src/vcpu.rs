// Copyright (c) 2023 by Rivos Inc.
// Licensed under the Apache License, Version 2.0, see LICENSE for details.
// SPDX-License-Identifier: Apache-2.0

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use drivers::lapic::Lapic;
use hyp_console::println;
use hyp_pages::DomainId;
use spin::Mutex;
use x86_regs::BasicExitReason;

use crate::domain::Domain;
use crate::state::VmmStateMachine;

/// A vCPU id, unique within its domain.
pub type VcpuId = u32;

/// Which world the vCPU belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VcpuKind {
    /// A vCPU of the privileged root guest; owns a local APIC shim.
    Root,
    /// A vCPU of an unprivileged guest.
    Guest,
}

/// Errors from vCPU lifecycle operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The VMM is latched corrupt; execution state changes are refused.
    VmmCorrupted,
    /// The vCPU is already running.
    AlreadyRunning,
    /// The vCPU is not running.
    NotRunning,
    /// The vCPU has been killed and cannot run again.
    Killed,
}

/// Holds results for vCPU operations.
pub type Result<T> = core::result::Result<T, Error>;

// Marks a trace record taken while the root context was active.
const EXIT_RECORD_ROOT: u32 = 1 << 31;

/// One traced VM exit.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExitRecord {
    pub reason: u32,
    pub guest_cr3: u64,
    pub data: [u64; 2],
}

const EXIT_RING_SLOTS: usize = 64;

struct ExitRing {
    slots: [ExitRecord; EXIT_RING_SLOTS],
    head: usize,
    filled: bool,
}

/// A fixed ring of the most recent VM exits, recorded when tracing is
/// enabled by the trace hypercalls.
pub struct ExitTrace {
    enabled: AtomicBool,
    ring: Mutex<ExitRing>,
}

impl ExitTrace {
    fn new() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            ring: Mutex::new(ExitRing {
                slots: [ExitRecord::default(); EXIT_RING_SLOTS],
                head: 0,
                filled: false,
            }),
        }
    }

    /// Turns tracing on or off.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Returns whether tracing is enabled.
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Records `record` if tracing is enabled.
    pub fn record(&self, mut record: ExitRecord, root_context: bool) {
        if !self.enabled() {
            return;
        }
        if root_context {
            record.reason |= EXIT_RECORD_ROOT;
        }
        let mut ring = self.ring.lock();
        let head = ring.head;
        ring.slots[head] = record;
        ring.head = (head + 1) % EXIT_RING_SLOTS;
        if ring.head == 0 {
            ring.filled = true;
        }
    }

    /// Returns the recorded exits, most recent first.
    pub fn collect(&self) -> alloc::vec::Vec<ExitRecord> {
        let ring = self.ring.lock();
        let mut out = alloc::vec::Vec::new();
        for i in (0..ring.head).rev() {
            out.push(ring.slots[i]);
        }
        if ring.filled {
            for i in (ring.head..EXIT_RING_SLOTS).rev() {
                out.push(ring.slots[i]);
            }
        }
        out
    }

    /// Dumps the recorded exits, most recent first, with per-reason field
    /// annotation.
    pub fn dump(&self) {
        println!("exit reasons (most recent first):");
        for record in self.collect() {
            dump_exit_record(&record);
        }
    }
}

fn dump_exit_record(record: &ExitRecord) {
    let ctx = if record.reason & EXIT_RECORD_ROOT != 0 {
        "r"
    } else {
        "g"
    };
    let raw = record.reason & !EXIT_RECORD_ROOT;
    let name = BasicExitReason::from_raw(raw).map(|r| r.name());
    match BasicExitReason::from_raw(raw) {
        Some(BasicExitReason::Cpuid) => println!(
            "[{}] cpuid: cr3=0x{:x} eax=0x{:x} ecx=0x{:x}",
            ctx, record.guest_cr3, record.data[0], record.data[1]
        ),
        Some(BasicExitReason::ExternalInterrupt) => println!(
            "[{}] external_interrupt: cr3=0x{:x} exitinfo=0x{:x}",
            ctx, record.guest_cr3, record.data[0]
        ),
        Some(BasicExitReason::Wrmsr) => println!(
            "[{}] wrmsr: cr3=0x{:x} msr=0x{:x} val=0x{:x}",
            ctx, record.guest_cr3, record.data[1], record.data[0]
        ),
        Some(BasicExitReason::Vmcall) => println!(
            "[{}] vmcall: cr3=0x{:x} rax=0x{:x}",
            ctx, record.guest_cr3, record.data[0]
        ),
        _ => println!(
            "[{}] {}: cr3=0x{:x}",
            ctx,
            name.unwrap_or("unknown"),
            record.guest_cr3
        ),
    }
}

/// A virtual CPU, bound to its domain for life.
pub struct Vcpu {
    id: VcpuId,
    domid: DomainId,
    kind: VcpuKind,
    dom: Weak<Domain>,
    upcall_vector: AtomicU8,
    running: AtomicBool,
    killed: AtomicBool,
    lapic: Option<Mutex<Lapic>>,
    trace: ExitTrace,
}

impl Vcpu {
    /// Creates a vCPU bound to `dom`. Root vCPUs carry the local APIC shim
    /// the dispatcher constructed for their physical CPU.
    pub fn new(id: VcpuId, dom: &Arc<Domain>, kind: VcpuKind, lapic: Option<Lapic>) -> Arc<Vcpu> {
        Arc::new(Vcpu {
            id,
            domid: dom.id(),
            kind,
            dom: Arc::downgrade(dom),
            upcall_vector: AtomicU8::new(0),
            running: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            lapic: lapic.map(Mutex::new),
            trace: ExitTrace::new(),
        })
    }

    /// Returns the vCPU's id within its domain.
    pub fn id(&self) -> VcpuId {
        self.id
    }

    /// Returns the id of the owning domain.
    pub fn domid(&self) -> DomainId {
        self.domid
    }

    /// Returns which world the vCPU belongs to.
    pub fn kind(&self) -> VcpuKind {
        self.kind
    }

    /// Returns the owning domain, unless it is already gone.
    pub fn domain(&self) -> Option<Arc<Domain>> {
        self.dom.upgrade()
    }

    /// Returns the vCPU's event upcall vector, 0 if unset.
    pub fn upcall_vector(&self) -> u8 {
        self.upcall_vector.load(Ordering::Relaxed)
    }

    /// Sets the vCPU's event upcall vector.
    pub fn set_upcall_vector(&self, vector: u8) {
        self.upcall_vector.store(vector, Ordering::Relaxed);
    }

    /// Returns the local APIC shim for root vCPUs.
    pub fn lapic(&self) -> Option<&Mutex<Lapic>> {
        self.lapic.as_ref()
    }

    /// Returns the VM-exit trace ring.
    pub fn trace(&self) -> &ExitTrace {
        &self.trace
    }

    /// Returns whether the vCPU is currently executing guest code.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Returns whether the vCPU has been killed.
    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// Marks the vCPU running. Refused once the VMM is corrupt or the vCPU
    /// killed.
    pub fn start(&self, vmm: &VmmStateMachine) -> Result<()> {
        if !vmm.is_usable() {
            return Err(Error::VmmCorrupted);
        }
        if self.is_killed() {
            return Err(Error::Killed);
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyRunning);
        }
        Ok(())
    }

    /// Marks the vCPU stopped.
    pub fn stop(&self, vmm: &VmmStateMachine) -> Result<()> {
        if !vmm.is_usable() {
            return Err(Error::VmmCorrupted);
        }
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(Error::NotRunning);
        }
        Ok(())
    }

    /// Kills the vCPU: it stops running and can never be started again.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
        self.running.store(false, Ordering::Release);
    }
}
