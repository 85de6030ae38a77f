//! Top-level machine: scheduler, VIC-II, CPU and RAM wired together.
//!
//! The VIC-II only talks to the CPU through [`CpuLines`]; the CPU only
//! talks to the VIC-II through its address bus.  Both advance as events
//! on the shared scheduler.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use super::cpu::{Cpu6510, SystemBus};
use super::event::{EventClock, EventError, EventId, EventScheduler, Phase, RemoteScheduler};
use super::signals::CpuLines;
use super::vic_ii::{Mos656x, VicModel};

// ── Model clocks ──────────────────────────────────────────────

struct ModelParams {
    color_burst: f64,
    divider: f64,
}

static MODELS: [ModelParams; 3] = [
    ModelParams { color_burst: 3_579_545.455, divider: 14.0 }, // Old NTSC
    ModelParams { color_burst: 3_579_545.455, divider: 14.0 }, // NTSC-M
    ModelParams { color_burst: 4_433_618.75, divider: 18.0 },  // PAL-B
];

/// CPU clock in Hz for a given VIC-II model.
pub fn cpu_freq(model: VicModel) -> f64 {
    let m = &MODELS[model as usize];
    (m.color_burst * 4.0) / m.divider
}

// ── Built-in demo ─────────────────────────────────────────────

const DEMO_START: u16 = 0x1000;
const DEMO_IRQ: u16 = 0x1100;
pub const DEMO_COUNTER: u16 = 0x0400;

/// SEI; DEN on, YSCROLL 3; raster compare 0; enable raster IRQ; CLI; spin.
const DEMO_MAIN: [u8; 20] = [
    0x78, // SEI
    0xA9, 0x1B, 0x8D, 0x11, 0xD0, // LDA #$1B; STA $D011
    0xA9, 0x00, 0x8D, 0x12, 0xD0, // LDA #$00; STA $D012
    0xA9, 0x01, 0x8D, 0x1A, 0xD0, // LDA #$01; STA $D01A
    0x58, // CLI
    0x4C, 0x11, 0x10, // JMP *
];

/// INC $0400; acknowledge raster IRQ; RTI.
const DEMO_HANDLER: [u8; 9] = [
    0xEE, 0x00, 0x04, // INC $0400
    0xA9, 0x01, 0x8D, 0x19, 0xD0, // LDA #$01; STA $D019
    0x40, // RTI
];

// ── Stats ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MachineStats {
    pub cycles: EventClock,
    pub instructions: u64,
    pub stolen_cycles: u64,
    pub irqs_taken: u64,
    pub irq_edges: u64,
    pub raster_x: u32,
    pub raster_y: u32,
}

// ── Reset handle ──────────────────────────────────────────────

/// `Send` handle that resets the machine from another thread.  The reset
/// happens on the simulation thread at its next event.
#[derive(Debug, Clone)]
pub struct ResetHandle {
    remote: RemoteScheduler,
    event: EventId,
}

impl ResetHandle {
    pub fn request_reset(&self) -> Result<(), EventError> {
        self.remote.schedule_thread_safe(self.event)
    }
}

// ── C64 Machine ───────────────────────────────────────────────

pub struct C64 {
    scheduler: Rc<EventScheduler>,
    vic: Rc<RefCell<Mos656x>>,
    cpu: Rc<RefCell<Cpu6510>>,
    lines: CpuLines,
    model: VicModel,
    reset_event: EventId,
}

impl C64 {
    pub fn new(model: VicModel) -> Self {
        let scheduler = Rc::new(EventScheduler::new());
        let lines = CpuLines::new();

        let vic = Mos656x::new(&scheduler, Box::new(lines.clone()));
        vic.borrow_mut().chip(model);
        let cpu = Cpu6510::new(&scheduler, SystemBus::new(Rc::clone(&vic)), lines.clone());

        let reset_event = {
            let vic = Rc::downgrade(&vic);
            let cpu = Rc::downgrade(&cpu);
            scheduler.add_event("Machine Reset", move || reset_chips(&vic, &cpu))
        };

        let mut c64 = Self {
            scheduler,
            vic,
            cpu,
            lines,
            model,
            reset_event,
        };
        c64.reset();
        c64
    }

    // ── Model configuration ───────────────────────────────────

    pub fn set_model(&mut self, model: VicModel) {
        self.model = model;
        self.vic.borrow_mut().chip(model);
    }

    pub fn model(&self) -> VicModel {
        self.model
    }

    pub fn cpu_frequency(&self) -> f64 {
        cpu_freq(self.model)
    }

    // ── Reset ─────────────────────────────────────────────────

    /// Power-on style reset: the clock restarts at zero.  RAM is kept.
    pub fn reset(&mut self) {
        self.scheduler.reset();
        self.lines.reset();
        self.vic.borrow_mut().reset();
        self.cpu.borrow_mut().reset();
    }

    pub fn reset_handle(&self) -> ResetHandle {
        ResetHandle {
            remote: self.scheduler.remote(),
            event: self.reset_event,
        }
    }

    // ── Memory ────────────────────────────────────────────────

    pub fn load(&mut self, addr: u16, data: &[u8]) -> usize {
        self.cpu.borrow_mut().bus_mut().load(addr, data)
    }

    /// Load a .prg image (2-byte little-endian load address + data) and
    /// return the load address.
    pub fn load_prg(&mut self, prg: &[u8]) -> Result<u16, String> {
        if prg.len() < 3 {
            return Err(format!("PRG too short ({} bytes)", prg.len()));
        }
        let addr = u16::from_le_bytes([prg[0], prg[1]]);
        let n = self.load(addr, &prg[2..]);
        if n < prg.len() - 2 {
            log::warn!("PRG at ${addr:04X} truncated to {n} bytes");
        }
        log::info!("Loaded PRG: ${:04X}-${:04X}", addr, addr as usize + n - 1);
        Ok(addr)
    }

    pub fn peek(&self, addr: u16) -> u8 {
        self.cpu.borrow().bus().peek(addr)
    }

    pub fn poke(&mut self, addr: u16, val: u8) {
        self.cpu.borrow_mut().bus_mut().poke(addr, val);
    }

    pub fn set_reset_vector(&mut self, addr: u16) {
        self.load(0xFFFC, &addr.to_le_bytes());
    }

    pub fn set_irq_vector(&mut self, addr: u16) {
        self.load(0xFFFE, &addr.to_le_bytes());
    }

    /// Install the raster IRQ demo: counts frames at $0400.  Takes effect
    /// on the next reset.
    pub fn install_demo(&mut self) {
        self.load(DEMO_START, &DEMO_MAIN);
        self.load(DEMO_IRQ, &DEMO_HANDLER);
        self.poke(DEMO_COUNTER, 0);
        self.set_reset_vector(DEMO_START);
        self.set_irq_vector(DEMO_IRQ);
    }

    // ── Running ───────────────────────────────────────────────

    pub fn run_cycles(&mut self, cycles: EventClock) -> Result<(), EventError> {
        self.scheduler.run_for(cycles)
    }

    pub fn run_frames(&mut self, frames: u32) -> Result<(), EventError> {
        self.run_cycles(frames as EventClock * self.model.cycles_per_frame())
    }

    pub fn cycles(&self) -> EventClock {
        self.scheduler.get_time(Phase::Phi1)
    }

    pub fn get_time_ms(&self) -> u32 {
        ((self.cycles() as f64 * 1000.0) / self.cpu_frequency()) as u32
    }

    pub fn stats(&self) -> MachineStats {
        let cpu = self.cpu.borrow();
        let vic = self.vic.borrow();
        MachineStats {
            cycles: self.cycles(),
            instructions: cpu.instructions(),
            stolen_cycles: cpu.stolen_cycles(),
            irqs_taken: cpu.irqs_taken(),
            irq_edges: self.lines.irq_edges(),
            raster_x: vic.raster_x(),
            raster_y: vic.raster_y(),
        }
    }

    // ── Chip access ───────────────────────────────────────────

    pub fn scheduler(&self) -> &Rc<EventScheduler> {
        &self.scheduler
    }

    pub fn vic(&self) -> &Rc<RefCell<Mos656x>> {
        &self.vic
    }

    pub fn cpu(&self) -> &Rc<RefCell<Cpu6510>> {
        &self.cpu
    }

    pub fn lines(&self) -> &CpuLines {
        &self.lines
    }
}

fn reset_chips(vic: &Weak<RefCell<Mos656x>>, cpu: &Weak<RefCell<Cpu6510>>) -> Result<(), String> {
    let vic = vic.upgrade().ok_or("VIC-II has been dropped")?;
    let cpu = cpu.upgrade().ok_or("CPU has been dropped")?;
    vic.try_borrow_mut().map_err(|_| "VIC-II is busy")?.reset();
    cpu.try_borrow_mut().map_err(|_| "CPU is busy")?.reset();
    log::info!("Machine reset requested");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::c64_emu::signals::BusSignals;
    use std::thread;

    fn demo(model: VicModel) -> C64 {
        let mut c64 = C64::new(model);
        c64.install_demo();
        c64.reset();
        c64
    }

    #[test]
    fn test_demo_counts_frames_pal() {
        let mut c64 = demo(VicModel::Mos6569);
        c64.run_frames(3).unwrap();
        assert_eq!(c64.peek(DEMO_COUNTER), 3);

        let stats = c64.stats();
        assert_eq!(stats.cycles, 3 * 312 * 63);
        assert_eq!(stats.irqs_taken, 3);
        assert_eq!(stats.irq_edges, 3);
        // DEN is on with YSCROLL 3: 25 bad lines a frame.
        assert!(stats.stolen_cycles >= 3 * 25 * 30);
    }

    #[test]
    fn test_demo_counts_frames_ntsc() {
        let mut c64 = demo(VicModel::Mos6567R8);
        c64.run_frames(2).unwrap();
        assert_eq!(c64.peek(DEMO_COUNTER), 2);
        assert_eq!(c64.cycles(), 2 * 263 * 65);
    }

    #[test]
    fn test_no_bad_lines_means_nothing_stolen() {
        let mut c64 = C64::new(VicModel::Mos6569);
        // NOP; JMP $1000 with the screen blanked.
        c64.load(0x1000, &[0xEA, 0x4C, 0x00, 0x10]);
        c64.set_reset_vector(0x1000);
        c64.reset();
        c64.run_frames(2).unwrap();
        assert_eq!(c64.stats().stolen_cycles, 0);
        assert_eq!(c64.stats().irqs_taken, 0);
    }

    #[test]
    fn test_load_prg() {
        let mut c64 = C64::new(VicModel::Mos6569);
        assert_eq!(c64.load_prg(&[0x01, 0x08, 0xAA, 0xBB]), Ok(0x0801));
        assert_eq!(c64.peek(0x0801), 0xAA);
        assert_eq!(c64.peek(0x0802), 0xBB);
        assert!(c64.load_prg(&[0x01, 0x08]).is_err());
    }

    #[test]
    fn test_remote_reset_from_other_thread() {
        let mut c64 = demo(VicModel::Mos6569);
        c64.run_frames(1).unwrap();
        assert_eq!(c64.vic().borrow().regs()[0x11], 0x1B);

        let handle = c64.reset_handle();
        thread::spawn(move || handle.request_reset())
            .join()
            .unwrap()
            .unwrap();

        c64.run_cycles(1).unwrap();
        assert_eq!(c64.vic().borrow().regs()[0x11], 0);
        assert_eq!(c64.cpu().borrow().irqs_taken(), 0);

        // The demo sets itself up again after the reset.
        c64.run_cycles(100).unwrap();
        assert_eq!(c64.vic().borrow().regs()[0x11], 0x1B);
    }

    #[test]
    fn test_reset_releases_lines_held_by_any_source() {
        let mut c64 = demo(VicModel::Mos6569);
        c64.run_frames(1).unwrap();

        let mut stuck = c64.lines().clone();
        stuck.set_bus_granted(false);
        stuck.set_interrupt_asserted(true);
        assert!(c64.lines().irq_asserted());

        c64.reset();
        assert!(c64.lines().bus_granted());
        assert!(!c64.lines().irq_asserted());
    }

    #[test]
    fn test_model_switch() {
        let mut c64 = C64::new(VicModel::Mos6569);
        assert!((c64.cpu_frequency() - 985_248.0).abs() < 1.0);
        c64.set_model(VicModel::Mos6567R8);
        assert_eq!(c64.model(), VicModel::Mos6567R8);
        assert_eq!(c64.vic().borrow().cycles_per_line(), 65);
        assert!((c64.cpu_frequency() - 1_022_727.0).abs() < 1.0);
    }
}
