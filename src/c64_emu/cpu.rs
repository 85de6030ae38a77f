//! Host 6510: the `mos6502` crate CPU driven as a scheduler event.
//!
//! The CPU runs on PHI2 and only ever looks at the two lines the chips
//! drive.  While AEC is low it stalls; while IRQ is low and the I flag is
//! clear it takes the interrupt.  Everything else is a whole instruction
//! per event, followed by a sleep of that opcode's cycle count.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use mos6502::cpu::CPU;
use mos6502::instruction::Nmos6502;
use mos6502::memory::Bus;
use mos6502::registers::{StackPointer, Status};

use super::event::{EventClock, EventId, EventScheduler, Phase};
use super::signals::CpuLines;
use super::vic_ii::Mos656x;

// ─────────────────────────────────────────────────────────────────────────────
//  Approximate 6502 cycle counts per opcode
// ─────────────────────────────────────────────────────────────────────────────

static OPCODE_CYCLES: [u8; 256] = [
    //0  1  2  3  4  5  6  7  8  9  A  B  C  D  E  F
    7, 6, 2, 8, 3, 3, 5, 5, 3, 2, 2, 2, 4, 4, 6, 6, // 0x
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // 1x
    6, 6, 2, 8, 3, 3, 5, 5, 4, 2, 2, 2, 4, 4, 6, 6, // 2x
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // 3x
    6, 6, 2, 8, 3, 3, 5, 5, 3, 2, 2, 2, 3, 4, 6, 6, // 4x
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // 5x
    6, 6, 2, 8, 3, 3, 5, 5, 4, 2, 2, 2, 5, 4, 6, 6, // 6x
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // 7x
    2, 6, 2, 6, 3, 3, 3, 3, 2, 2, 2, 2, 4, 4, 4, 4, // 8x
    2, 6, 2, 6, 4, 4, 4, 4, 2, 5, 2, 5, 5, 5, 5, 5, // 9x
    2, 6, 2, 6, 3, 3, 3, 3, 2, 2, 2, 2, 4, 4, 4, 4, // Ax
    2, 5, 2, 5, 4, 4, 4, 4, 2, 4, 2, 4, 4, 4, 4, 4, // Bx
    2, 6, 2, 8, 3, 3, 5, 5, 2, 2, 2, 2, 4, 4, 6, 6, // Cx
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // Dx
    2, 6, 2, 8, 3, 3, 5, 5, 2, 2, 2, 2, 4, 4, 6, 6, // Ex
    2, 5, 2, 8, 4, 4, 6, 6, 2, 4, 2, 7, 4, 4, 7, 7, // Fx
];

const RESET_VECTOR: u16 = 0xFFFC;
const IRQ_VECTOR: u16 = 0xFFFE;

/// The 6502 interrupt sequence takes 7 cycles.
const IRQ_ENTRY_CYCLES: EventClock = 7;

const VIC_BASE: u16 = 0xD000;
const VIC_END: u16 = 0xD3FF;

// ─────────────────────────────────────────────────────────────────────────────
//  SystemBus: RAM plus the VIC-II window
// ─────────────────────────────────────────────────────────────────────────────

/// Address bus seen by the CPU: 64K of RAM with the VIC-II registers at
/// $D000-$D3FF, repeated every 64 bytes.
pub struct SystemBus {
    ram: Box<[u8]>,
    vic: Rc<RefCell<Mos656x>>,
}

impl SystemBus {
    pub fn new(vic: Rc<RefCell<Mos656x>>) -> Self {
        Self {
            ram: vec![0u8; 0x10000].into_boxed_slice(),
            vic,
        }
    }

    /// RAM contents, bypassing I/O.
    pub fn peek(&self, addr: u16) -> u8 {
        self.ram[addr as usize]
    }

    pub fn poke(&mut self, addr: u16, val: u8) {
        self.ram[addr as usize] = val;
    }

    /// Copy `data` into RAM at `addr`.  Anything past $FFFF is dropped.
    pub fn load(&mut self, addr: u16, data: &[u8]) -> usize {
        let a = addr as usize;
        let end = (a + data.len()).min(0x10000);
        self.ram[a..end].copy_from_slice(&data[..end - a]);
        end - a
    }

    fn is_vic(addr: u16) -> bool {
        (VIC_BASE..=VIC_END).contains(&addr)
    }
}

impl Bus for SystemBus {
    fn get_byte(&mut self, addr: u16) -> u8 {
        if Self::is_vic(addr) {
            return self.vic.borrow_mut().read((addr & 0x3F) as u8);
        }
        self.ram[addr as usize]
    }

    fn set_byte(&mut self, addr: u16, val: u8) {
        // Writes to I/O also land in the RAM underneath.
        self.ram[addr as usize] = val;
        if Self::is_vic(addr) {
            self.vic.borrow_mut().write((addr & 0x3F) as u8, val);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Cpu6510
// ─────────────────────────────────────────────────────────────────────────────

pub struct Cpu6510 {
    cpu: CPU<SystemBus, Nmos6502>,
    lines: CpuLines,
    scheduler: Rc<EventScheduler>,
    event: EventId,

    instructions: u64,
    stolen_cycles: u64,
    irqs_taken: u64,
}

impl Cpu6510 {
    /// Create the CPU.  Like the chips, it does nothing until [`reset`](Self::reset).
    pub fn new(scheduler: &Rc<EventScheduler>, bus: SystemBus, lines: CpuLines) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|me: &Weak<RefCell<Self>>| {
            let me = me.clone();
            let event = scheduler.add_event("CPU", move || {
                let cpu = me.upgrade().ok_or("CPU has been dropped")?;
                let mut cpu = cpu.try_borrow_mut().map_err(|_| "CPU is busy")?;
                cpu.event();
                Ok(())
            });

            RefCell::new(Self {
                cpu: CPU::new(bus, Nmos6502),
                lines,
                scheduler: Rc::clone(scheduler),
                event,
                instructions: 0,
                stolen_cycles: 0,
                irqs_taken: 0,
            })
        })
    }

    /// Load PC from the reset vector and start executing on the next PHI2.
    pub fn reset(&mut self) {
        let lo = self.cpu.memory.get_byte(RESET_VECTOR) as u16;
        let hi = self.cpu.memory.get_byte(RESET_VECTOR + 1) as u16;
        self.cpu.registers.program_counter = (hi << 8) | lo;
        self.cpu.registers.stack_pointer = StackPointer(0xFD);
        self.cpu.registers.status.insert(Status::PS_DISABLE_INTERRUPTS);

        self.instructions = 0;
        self.stolen_cycles = 0;
        self.irqs_taken = 0;

        log::debug!("CPU reset, PC=${:04X}", self.cpu.registers.program_counter);
        self.scheduler.cancel(self.event);
        self.scheduler.schedule(self.event, 0, Phase::Phi2);
    }

    fn event(&mut self) {
        let cycles = self.step();
        self.scheduler.schedule(self.event, cycles, Phase::Phi2);
    }

    /// Do one unit of work and return how many cycles it took.
    pub fn step(&mut self) -> EventClock {
        if !self.lines.bus_granted() {
            self.stolen_cycles += 1;
            return 1;
        }

        if self.lines.irq_asserted()
            && !self.cpu.registers.status.contains(Status::PS_DISABLE_INTERRUPTS)
        {
            self.deliver_irq();
            return IRQ_ENTRY_CYCLES;
        }

        let pc = self.cpu.registers.program_counter;
        let cycles = OPCODE_CYCLES[self.cpu.memory.peek(pc) as usize] as EventClock;
        self.cpu.single_step();
        self.instructions += 1;
        cycles
    }

    /// Interrupt entry (the mos6502 crate has no IRQ input): push PC and
    /// P with B clear, set I, jump through $FFFE.
    fn deliver_irq(&mut self) {
        let pc = self.cpu.registers.program_counter;
        let status_byte = (self.cpu.registers.status.bits() | 0x20) & !0x10;

        self.push((pc >> 8) as u8);
        self.push((pc & 0xFF) as u8);
        self.push(status_byte);

        self.cpu.registers.status.insert(Status::PS_DISABLE_INTERRUPTS);

        let lo = self.cpu.memory.get_byte(IRQ_VECTOR) as u16;
        let hi = self.cpu.memory.get_byte(IRQ_VECTOR + 1) as u16;
        self.cpu.registers.program_counter = (hi << 8) | lo;
        self.irqs_taken += 1;
        log::trace!("IRQ taken at ${pc:04X}");
    }

    fn push(&mut self, val: u8) {
        let sp = self.cpu.registers.stack_pointer.0;
        self.cpu.memory.set_byte(0x0100 | sp as u16, val);
        self.cpu.registers.stack_pointer = StackPointer(sp.wrapping_sub(1));
    }

    // ── Accessors ────────────────────────────────────────────────────────

    pub fn program_counter(&self) -> u16 {
        self.cpu.registers.program_counter
    }

    pub fn stack_pointer(&self) -> u8 {
        self.cpu.registers.stack_pointer.0
    }

    pub fn interrupts_disabled(&self) -> bool {
        self.cpu.registers.status.contains(Status::PS_DISABLE_INTERRUPTS)
    }

    pub fn bus(&self) -> &SystemBus {
        &self.cpu.memory
    }

    pub fn bus_mut(&mut self) -> &mut SystemBus {
        &mut self.cpu.memory
    }

    pub fn event_id(&self) -> EventId {
        self.event
    }

    pub fn instructions(&self) -> u64 {
        self.instructions
    }

    /// Cycles spent waiting for AEC.
    pub fn stolen_cycles(&self) -> u64 {
        self.stolen_cycles
    }

    pub fn irqs_taken(&self) -> u64 {
        self.irqs_taken
    }
}

impl Drop for Cpu6510 {
    fn drop(&mut self) {
        self.scheduler.cancel(self.event);
    }
}
