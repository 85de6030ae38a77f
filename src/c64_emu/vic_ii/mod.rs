//! MOS 6567/6569 (VIC-II) raster and DMA timing.
//!
//! No pixels, only the bus side of the chip: raster position, raster and
//! lightpen IRQs, bad-line DMA and sprite DMA.  Exactly what a SID player
//! needs to see CPU cycles disappear at the right moments.
//!
//! The chip drives itself through one scheduler event.  Each firing runs
//! [`Mos656x::clock`], which catches the raster up to the current cycle,
//! handles whatever happens on that cycle of the line and returns how long
//! the chip may sleep before anything can change again.

pub mod lightpen;
pub mod sprites;

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};

use super::event::{EventClock, EventId, EventScheduler, Phase};
use super::signals::BusSignals;
use lightpen::Lightpen;
use sprites::Sprites;

// ── Model data ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VicModel {
    #[serde(alias = "old-ntsc")]
    Mos6567R56A, // Old NTSC
    #[serde(alias = "ntsc")]
    Mos6567R8, // NTSC-M
    #[serde(alias = "pal")]
    Mos6569, // PAL-B
}

pub struct ModelData {
    pub raster_lines: u32,
    pub cycles_per_line: u32,
    pub first_dma_line: u32,
    pub last_dma_line: u32,
}

static MODEL_DATA: [ModelData; 3] = [
    ModelData {
        raster_lines: 262,
        cycles_per_line: 64,
        first_dma_line: 0x30,
        last_dma_line: 0xF7,
    }, // Old NTSC
    ModelData {
        raster_lines: 263,
        cycles_per_line: 65,
        first_dma_line: 0x30,
        last_dma_line: 0xF7,
    }, // NTSC-M
    ModelData {
        raster_lines: 312,
        cycles_per_line: 63,
        first_dma_line: 0x30,
        last_dma_line: 0xF7,
    }, // PAL-B
];

impl VicModel {
    pub fn data(self) -> &'static ModelData {
        &MODEL_DATA[self as usize]
    }

    pub fn cycles_per_frame(self) -> EventClock {
        let md = self.data();
        (md.raster_lines * md.cycles_per_line) as EventClock
    }
}

// ── Registers ─────────────────────────────────────────────────

pub const REG_CONTROL_1: u8 = 0x11;
pub const REG_RASTER: u8 = 0x12;
pub const REG_LIGHTPEN_X: u8 = 0x13;
pub const REG_LIGHTPEN_Y: u8 = 0x14;
pub const REG_SPRITE_ENABLE: u8 = 0x15;
pub const REG_SPRITE_Y_EXPAND: u8 = 0x17;
pub const REG_IRQ_FLAGS: u8 = 0x19;
pub const REG_IRQ_MASK: u8 = 0x1A;

/// First of the unimplemented addresses; these and everything above read $FF.
const FIRST_UNUSED_REG: u8 = 0x2F;
const LAST_REG: u8 = 0x3F;

const CTRL1_DEN: u8 = 0x10;

// ── IRQ flags ─────────────────────────────────────────────────

pub const IRQ_RASTER: u8 = 1 << 0;
pub const IRQ_LIGHTPEN: u8 = 1 << 3;
pub const IRQ_REQUEST: u8 = 1 << 7;

/// `raster_x == 0` is cycle 9 of the line, where the raster counter steps.
const CYCLE_OFFSET: u32 = 9;

// ── MOS656X ───────────────────────────────────────────────────

/// VIC-II chip state.
///
/// Created idle; [`reset`](Self::reset) arms its event.  The event body
/// borrows the chip mutably, so don't hold a borrow across scheduler runs.
pub struct Mos656x {
    scheduler: Rc<EventScheduler>,
    env: Box<dyn BusSignals>,
    event: EventId,
    phase: Phase,

    regs: [u8; 0x40],

    model: VicModel,
    raster_lines: u32,
    cycles_per_line: u32,
    first_dma_line: u32,
    last_dma_line: u32,

    /// Cycle the raster position was last brought up to date.
    raster_clk: EventClock,
    raster_x: u32,
    raster_y: u32,
    raster_irq: u32,

    ctrl1: u8,
    y_scroll: u32,
    icr: u8,
    idr: u8,

    bad_line: bool,
    bad_lines_enabled: bool,
    vblanking: bool,
    bus_granted: bool,

    lp: Lightpen,
    sprites: Sprites,
}

impl Mos656x {
    pub fn new(scheduler: &Rc<EventScheduler>, env: Box<dyn BusSignals>) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|me: &Weak<RefCell<Self>>| {
            let me = me.clone();
            let event = scheduler.add_event("VIC Raster", move || {
                let vic = me.upgrade().ok_or("VIC-II has been dropped")?;
                let mut vic = vic.try_borrow_mut().map_err(|_| "VIC-II is busy")?;
                vic.event();
                Ok(())
            });

            let md = VicModel::Mos6569.data();
            RefCell::new(Self {
                scheduler: Rc::clone(scheduler),
                env,
                event,
                phase: Phase::Phi1,
                regs: [0; 0x40],
                model: VicModel::Mos6569,
                raster_lines: md.raster_lines,
                cycles_per_line: md.cycles_per_line,
                first_dma_line: md.first_dma_line,
                last_dma_line: md.last_dma_line,
                raster_clk: 0,
                raster_x: 0,
                raster_y: md.raster_lines - 1,
                raster_irq: 0,
                ctrl1: 0,
                y_scroll: 0,
                icr: 0,
                idr: 0,
                bad_line: false,
                bad_lines_enabled: false,
                vblanking: false,
                bus_granted: true,
                lp: Lightpen::new(),
                sprites: Sprites::new(),
            })
        })
    }

    /// Switch timing constants.  The raster restarts at the last line so
    /// the next step begins a frame; nothing else is cleared.
    pub fn chip(&mut self, model: VicModel) {
        // Account for the cycles run under the old model; rearm reschedules.
        self.clock();

        let md = model.data();
        self.model = model;
        self.raster_lines = md.raster_lines;
        self.cycles_per_line = md.cycles_per_line;
        self.first_dma_line = md.first_dma_line;
        self.last_dma_line = md.last_dma_line;

        self.raster_y = self.raster_lines - 1;
        self.raster_x %= self.cycles_per_line;
        self.vblanking = false;
        log::info!(
            "VIC-II model {:?}: {} lines x {} cycles",
            model,
            self.raster_lines,
            self.cycles_per_line
        );
        self.rearm();
    }

    pub fn reset(&mut self) {
        self.icr = 0;
        self.ctrl1 = 0;
        self.raster_irq = 0;
        self.y_scroll = 0;
        self.raster_y = self.raster_lines - 1;
        self.raster_x = 0;
        self.bad_line = false;
        self.bad_lines_enabled = false;
        self.vblanking = false;
        self.regs.fill(0);
        self.lp.reset();
        self.sprites.reset();

        // Release anything still held on the CPU side.
        self.clear_interrupts();
        self.set_bus_granted(true);

        log::debug!(
            "VIC-II reset at cycle {}",
            self.scheduler.get_time(self.phase)
        );
        self.rearm();
    }

    fn rearm(&mut self) {
        self.raster_clk = self.scheduler.get_time(self.phase);
        self.scheduler.cancel(self.event);
        self.scheduler.schedule(self.event, 0, self.phase);
    }

    // ── Register access ───────────────────────────────────────

    pub fn read(&mut self, addr: u8) -> u8 {
        if addr > LAST_REG {
            return 0;
        }
        if addr >= FIRST_UNUSED_REG {
            return 0xFF;
        }

        self.event();

        match addr {
            REG_CONTROL_1 => (self.ctrl1 & 0x7F) | (((self.raster_y & 0x100) >> 1) as u8),
            REG_RASTER => (self.raster_y & 0xFF) as u8,
            REG_LIGHTPEN_X => self.lp.get_x(),
            REG_LIGHTPEN_Y => self.lp.get_y(),
            REG_IRQ_FLAGS => self.idr | 0x70,
            REG_IRQ_MASK => self.icr | 0xF0,
            _ => self.regs[addr as usize],
        }
    }

    pub fn write(&mut self, addr: u8, data: u8) {
        if addr > LAST_REG {
            return;
        }

        self.event();
        self.regs[addr as usize] = data;

        match addr {
            REG_CONTROL_1 => {
                self.raster_irq = (self.raster_irq & 0xFF) | ((data as u32 & 0x80) << 1);
                self.ctrl1 = data;
                self.y_scroll = (data & 0x07) as u32;

                // Before cycle 20 the line's bad-line check hasn't run yet.
                if self.raster_x < 11 {
                    return;
                }
                self.check_bad_line();

                // Bad-line DMA can still start mid-line.
                if self.bad_line && self.raster_x < 53 {
                    self.set_bus_granted(false);
                }
            }
            REG_RASTER => {
                self.raster_irq = (self.raster_irq & 0x100) | data as u32;
            }
            REG_SPRITE_Y_EXPAND => {
                self.sprites.write_y_expansion(data);
            }
            REG_IRQ_FLAGS => {
                // Acknowledge: 1 bits clear their flag.
                self.idr &= (!data & 0x0F) | IRQ_REQUEST;
                if self.idr == IRQ_REQUEST {
                    self.clear_interrupts();
                }
            }
            REG_IRQ_MASK => {
                self.icr = data & 0x0F;
                let enabled = self.icr & self.idr;
                if enabled != 0 {
                    self.trigger(enabled);
                }
            }
            _ => {}
        }
    }

    // ── Lightpen ──────────────────────────────────────────────

    pub fn lightpen(&mut self) {
        self.event();
        if self.lp.trigger(self.raster_x, self.raster_y) {
            self.trigger(IRQ_LIGHTPEN);
        }
    }

    // ── State inspection ──────────────────────────────────────

    pub fn model(&self) -> VicModel {
        self.model
    }

    pub fn cycles_per_line(&self) -> u32 {
        self.cycles_per_line
    }

    pub fn raster_lines(&self) -> u32 {
        self.raster_lines
    }

    pub fn event_id(&self) -> EventId {
        self.event
    }

    pub fn raster_x(&self) -> u32 {
        self.raster_x
    }

    pub fn raster_y(&self) -> u32 {
        self.raster_y
    }

    pub fn is_bad_line(&self) -> bool {
        self.bad_line
    }

    pub fn bad_lines_enabled(&self) -> bool {
        self.bad_lines_enabled
    }

    pub fn y_scroll(&self) -> u32 {
        self.y_scroll
    }

    pub fn first_dma_line(&self) -> u32 {
        self.first_dma_line
    }

    pub fn last_dma_line(&self) -> u32 {
        self.last_dma_line
    }

    pub fn sprite_dma(&self) -> u8 {
        self.sprites.dma
    }

    pub fn sprite_expand_y(&self) -> u8 {
        self.sprites.expand_y()
    }

    pub fn sprite_counter(&self, sprite: usize) -> u8 {
        self.sprites.counter(sprite)
    }

    pub fn irq_flags(&self) -> u8 {
        self.idr
    }

    pub fn bus_granted(&self) -> bool {
        self.bus_granted
    }

    /// Raw register file, as last written.
    pub fn regs(&self) -> &[u8; 0x40] {
        &self.regs
    }

    // ── Timing ────────────────────────────────────────────────

    /// Bring the chip up to date and reschedule its event.
    fn event(&mut self) {
        let delay = self.clock();
        self.scheduler.schedule(self.event, delay, self.phase);
    }

    /// Catch up to the current cycle and return the cycles until the
    /// next one that needs attention.
    fn clock(&mut self) -> EventClock {
        let now = self.scheduler.get_time(self.phase);
        let cycles = now - self.raster_clk;
        if cycles <= 0 {
            // Already up to date (or the scheduler clock was reset).
            self.raster_clk = now;
            return 1;
        }
        self.raster_clk = now;

        let xrasters = self.cycles_per_line as EventClock;
        self.raster_x = ((self.raster_x as EventClock + cycles) % xrasters) as u32;
        let cycle = (self.raster_x + CYCLE_OFFSET) % self.cycles_per_line;

        let mut delay: EventClock = 1;

        match cycle {
            0 => {
                self.sprites.begin_line((self.raster_y & 0xFF) as u8, &self.regs);
                delay = 2;
                if self.sprites.is_dma(0x01) {
                    self.set_bus_granted(false);
                } else {
                    self.set_bus_granted(true);
                    // No sprites before the next compulsory cycle
                    if !self.sprites.is_dma(0x1F) {
                        delay = 9;
                    }
                }
            }
            1 | 16 | 18 => {}

            // Each sprite owns two cycles: it takes the bus on the even one
            // and gives it back once neither it nor its successor needs it.
            2 => self.deny_if_dma(0x02),
            3 => self.grant_unless_dma(0x03),
            4 => self.deny_if_dma(0x04),
            5 => self.grant_unless_dma(0x06),
            6 => self.deny_if_dma(0x08),
            7 => self.grant_unless_dma(0x0C),
            8 => self.deny_if_dma(0x10),
            9 => {
                self.next_raster_line();
                self.grant_unless_dma(0x18);
            }
            10 => {
                self.end_vblank();
                if self.sprites.is_dma(0x20) {
                    self.set_bus_granted(false);
                } else if !self.sprites.is_dma(0xF8) {
                    delay = 10;
                }
            }
            11 => self.grant_unless_dma(0x30),
            12 => self.deny_if_dma(0x40),
            13 => self.grant_unless_dma(0x60),
            14 => self.deny_if_dma(0x80),
            15 => {
                delay = 2;
                if !self.sprites.is_dma(0xC0) {
                    self.set_bus_granted(true);
                    delay = 5;
                }
            }
            17 => {
                delay = 2;
                if !self.sprites.is_dma(0x80) {
                    self.set_bus_granted(true);
                    delay = 3;
                }
            }
            19 => self.set_bus_granted(true),

            20 => {
                self.check_bad_line();
                // DMA starts on cycle 23
                if self.bad_line {
                    self.set_bus_granted(false);
                }
                delay = 3;
            }
            23 => self.sprites.advance_expanded(),
            24 => {
                self.sprites.advance_and_retire();
                delay = 39;
            }

            // End of bad-line DMA; PAL lines wrap before getting here.
            63 => {
                self.set_bus_granted(true);
                delay = xrasters - 63;
            }

            _ => {
                let cycle = cycle as EventClock;
                delay = if cycle < 23 {
                    23 - cycle
                } else if cycle < 63 {
                    63 - cycle
                } else {
                    xrasters - cycle
                };
            }
        }

        delay
    }

    // ── Internals ─────────────────────────────────────────────

    fn deny_if_dma(&mut self, sprites: u8) {
        if self.sprites.is_dma(sprites) {
            self.set_bus_granted(false);
        }
    }

    fn grant_unless_dma(&mut self, sprites: u8) {
        if !self.sprites.is_dma(sprites) {
            self.set_bus_granted(true);
        }
    }

    fn set_bus_granted(&mut self, granted: bool) {
        if self.bus_granted != granted {
            self.bus_granted = granted;
            self.env.set_bus_granted(granted);
        }
    }

    fn next_raster_line(&mut self) {
        if self.raster_y == self.raster_lines - 1 {
            self.vblanking = true;
            return;
        }
        self.raster_y += 1;
        if self.raster_y == self.raster_irq {
            self.trigger(IRQ_RASTER);
        }
    }

    fn end_vblank(&mut self) {
        if !self.vblanking {
            return;
        }
        self.vblanking = false;
        self.lp.untrigger();
        self.raster_y = 0;
        if self.raster_irq == 0 {
            self.trigger(IRQ_RASTER);
        }
    }

    fn check_bad_line(&mut self) {
        // In the first DMA line the DEN bit decides whether bad lines
        // can occur this frame.
        if self.raster_y == self.first_dma_line && self.ctrl1 & CTRL1_DEN != 0 {
            self.bad_lines_enabled = true;
        }
        self.bad_line = self.evaluate_is_bad_line();
    }

    fn evaluate_is_bad_line(&self) -> bool {
        self.bad_lines_enabled
            && self.raster_y >= self.first_dma_line
            && self.raster_y <= self.last_dma_line
            && (self.raster_y & 7) == self.y_scroll
    }

    fn trigger(&mut self, irq: u8) {
        self.idr |= irq;
        if self.icr & self.idr != 0 && self.idr & IRQ_REQUEST == 0 {
            self.idr |= IRQ_REQUEST;
            self.env.set_interrupt_asserted(true);
        }
    }

    fn clear_interrupts(&mut self) {
        if self.idr & IRQ_REQUEST != 0 {
            self.env.set_interrupt_asserted(false);
        }
        self.idr = 0;
    }
}

impl Drop for Mos656x {
    fn drop(&mut self) {
        self.scheduler.cancel(self.event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::c64_emu::signals::recording::{RecordingSignals, Signal};

    const PAL_LINE: EventClock = 63;

    fn pal() -> (Rc<EventScheduler>, Rc<RefCell<Mos656x>>, RecordingSignals) {
        let sched = Rc::new(EventScheduler::new());
        let rec = RecordingSignals::default();
        let vic = Mos656x::new(&sched, Box::new(rec.clone()));
        vic.borrow_mut().reset();
        (sched, vic, rec)
    }

    /// Cycle at which the raster steps to PAL line `n` (n >= 1) in the
    /// first frame after reset.  Line 311 fills the first 63 cycles.
    fn line_start(n: EventClock) -> EventClock {
        (n + 1) * PAL_LINE
    }

    #[test]
    fn test_reset_state() {
        let (sched, vic, _) = pal();
        {
            let mut v = vic.borrow_mut();
            v.write(0x20, 0x0E);
            v.write(REG_SPRITE_Y_EXPAND, 0xFF);
            v.reset();
        }
        let v = vic.borrow();
        assert!(v.regs().iter().all(|&r| r == 0));
        assert_eq!(v.sprite_expand_y(), 0xFF);
        assert_eq!(v.sprite_dma(), 0);
        assert_eq!(v.raster_y(), 311);
        assert_eq!(v.raster_x(), 0);
        assert_eq!(v.irq_flags(), 0);
        assert!(sched.is_pending(v.event_id()));
    }

    #[test]
    fn test_counters_stay_in_range() {
        let (sched, vic, _) = pal();
        for _ in 0..2_000 {
            sched.run_for(17).unwrap();
            let mut v = vic.borrow_mut();
            v.read(REG_RASTER);
            assert!(v.raster_x() < 63);
            assert!(v.raster_y() < 312);
        }
    }

    #[test]
    fn test_raster_steps_once_per_line() {
        let (sched, vic, _) = pal();
        sched.run_until(line_start(5) + 20).unwrap();
        let (x0, y0) = {
            let mut v = vic.borrow_mut();
            v.read(REG_RASTER);
            (v.raster_x(), v.raster_y())
        };
        assert_eq!((x0, y0), (20, 5));

        sched.run_for(PAL_LINE).unwrap();
        let mut v = vic.borrow_mut();
        assert_eq!(v.read(REG_RASTER), 6);
        assert_eq!(v.raster_x(), x0);
    }

    #[test]
    fn test_full_frame_returns_to_line_zero_with_one_irq() {
        let (sched, vic, rec) = pal();
        {
            let mut v = vic.borrow_mut();
            v.write(REG_RASTER, 0);
            v.write(REG_IRQ_MASK, IRQ_RASTER);
        }

        // First line 0 after reset is at cycle 64.
        sched.run_until(65).unwrap();
        assert_eq!(vic.borrow().raster_y(), 0);
        assert_eq!(rec.irq_edges(), 1);
        vic.borrow_mut().write(REG_IRQ_FLAGS, IRQ_RASTER);
        assert_eq!(rec.take().last(), Some(&Signal::Irq(false)));

        sched.run_for(312 * PAL_LINE).unwrap();
        let v = vic.borrow();
        assert_eq!(v.raster_y(), 0);
        assert_eq!(rec.irq_edges(), 1);
    }

    #[test]
    fn test_raster_irq_on_regular_line() {
        let (sched, vic, rec) = pal();
        {
            let mut v = vic.borrow_mut();
            v.write(REG_RASTER, 0x40);
            v.write(REG_IRQ_MASK, IRQ_RASTER);
        }
        sched.run_until(line_start(0x40)).unwrap();
        assert_eq!(rec.irq_edges(), 0);
        sched.run_for(1).unwrap();
        assert_eq!(rec.irq_edges(), 1);
        assert_eq!(vic.borrow_mut().read(REG_IRQ_FLAGS), 0xF1);
    }

    #[test]
    fn test_raster_compare_high_bit_via_control_register() {
        let (sched, vic, rec) = pal();
        {
            let mut v = vic.borrow_mut();
            v.write(REG_RASTER, 0x05);
            v.write(REG_CONTROL_1, 0x80);
            v.write(REG_IRQ_MASK, IRQ_RASTER);
        }
        sched.run_until(line_start(0x05) + 1).unwrap();
        assert_eq!(rec.irq_edges(), 0);
        sched.run_until(line_start(0x105) + 1).unwrap();
        assert_eq!(rec.irq_edges(), 1);

        let mut v = vic.borrow_mut();
        assert_eq!(v.read(REG_CONTROL_1) & 0x80, 0x80);
        assert_eq!(v.read(REG_RASTER), 0x05);
    }

    #[test]
    fn test_irq_mask_write_asserts_latched_flags() {
        let (sched, vic, rec) = pal();
        sched.run_until(66).unwrap();
        {
            let v = vic.borrow();
            assert_eq!(v.irq_flags(), IRQ_RASTER);
        }
        assert_eq!(rec.irq_edges(), 0);

        let mut v = vic.borrow_mut();
        v.write(REG_IRQ_MASK, IRQ_RASTER);
        assert_eq!(rec.irq_edges(), 1);
        assert_eq!(v.irq_flags(), IRQ_RASTER | IRQ_REQUEST);

        // No second edge while the request is already up.
        v.write(REG_IRQ_MASK, IRQ_RASTER | IRQ_LIGHTPEN);
        v.lightpen();
        assert_eq!(rec.irq_edges(), 1);
    }

    #[test]
    fn test_irq_ack_is_write_one_to_clear() {
        let (sched, vic, rec) = pal();
        vic.borrow_mut().write(REG_IRQ_MASK, IRQ_RASTER | IRQ_LIGHTPEN);
        sched.run_until(70).unwrap();
        vic.borrow_mut().lightpen();
        rec.take();

        let mut v = vic.borrow_mut();
        assert_eq!(v.irq_flags(), IRQ_RASTER | IRQ_LIGHTPEN | IRQ_REQUEST);

        v.write(REG_IRQ_FLAGS, IRQ_RASTER);
        assert_eq!(v.irq_flags(), IRQ_LIGHTPEN | IRQ_REQUEST);
        assert!(rec.take().is_empty());

        v.write(REG_IRQ_FLAGS, IRQ_LIGHTPEN);
        assert_eq!(v.irq_flags(), 0);
        assert_eq!(rec.take(), vec![Signal::Irq(false)]);
    }

    #[test]
    fn test_bad_line_condition_every_line() {
        let (sched, vic, rec) = pal();
        // DEN on, YSCROLL = 3
        vic.borrow_mut().write(REG_CONTROL_1, 0x1B);

        let mut bad_lines = 0;
        for line in 1..312 {
            // Just after cycle 20 of this line.
            sched.run_until(line_start(line) + 12).unwrap();
            let v = vic.borrow();
            let y = v.raster_y();
            assert_eq!(y, line as u32);
            let expected = (v.first_dma_line()..=v.last_dma_line()).contains(&y)
                && (y & 7) == v.y_scroll()
                && v.bad_lines_enabled();
            assert_eq!(v.is_bad_line(), expected, "line {y:#x}");
            if expected {
                bad_lines += 1;
                assert!(!v.bus_granted());
            }
        }
        assert_eq!(bad_lines, 25);
        assert!(rec.take().contains(&Signal::Bus(false)));
    }

    #[test]
    fn test_bad_lines_need_den_in_first_dma_line() {
        let (sched, vic, _) = pal();
        vic.borrow_mut().write(REG_CONTROL_1, 0x03);
        sched.run_until(line_start(0x31)).unwrap();
        assert!(!vic.borrow().bad_lines_enabled());

        // Too late for this frame.
        vic.borrow_mut().write(REG_CONTROL_1, 0x13);
        sched.run_until(line_start(0x33) + 12).unwrap();
        let v = vic.borrow();
        assert!(!v.bad_lines_enabled());
        assert!(!v.is_bad_line());
    }

    #[test]
    fn test_bad_line_releases_bus_at_end_of_line() {
        let (sched, vic, rec) = pal();
        vic.borrow_mut().write(REG_CONTROL_1, 0x10); // DEN, YSCROLL 0
        sched.run_until(line_start(0x30)).unwrap();
        rec.take();

        sched.run_for(PAL_LINE).unwrap();
        assert_eq!(rec.take(), vec![Signal::Bus(false), Signal::Bus(true)]);
    }

    #[test]
    fn test_sprite_dma_denies_bus_on_cycle_zero() {
        let (sched, vic, rec) = pal();
        sched.run_until(line_start(0x40) + 10).unwrap();
        {
            let mut v = vic.borrow_mut();
            assert_eq!(v.read(REG_RASTER), 0x40);
            v.write(0x01, 0x40);
            v.write(REG_SPRITE_ENABLE, 0x01);
            assert_eq!(v.sprite_dma(), 0);
        }
        rec.take();

        sched.run_for(PAL_LINE).unwrap();
        assert_eq!(vic.borrow().sprite_dma() & 0x01, 0x01);
        let signals = rec.take();
        let first_bus = signals.iter().find(|s| matches!(s, Signal::Bus(_)));
        assert_eq!(first_bus, Some(&Signal::Bus(false)));
        assert!(signals.contains(&Signal::Bus(true)));
    }

    #[test]
    fn test_sprite_dma_ends_after_21_lines() {
        let (sched, vic, _) = pal();
        sched.run_until(line_start(0x40) + 10).unwrap();
        {
            let mut v = vic.borrow_mut();
            v.write(0x01, 0x40);
            v.write(REG_SPRITE_ENABLE, 0x01);
        }
        sched.run_for(PAL_LINE).unwrap();
        assert_eq!(vic.borrow().sprite_dma(), 0x01);

        sched.run_for(20 * PAL_LINE).unwrap();
        assert_eq!(vic.borrow().sprite_dma(), 0x01);
        sched.run_for(PAL_LINE).unwrap();
        let v = vic.borrow();
        assert_eq!(v.sprite_dma(), 0x00);
        assert_eq!(v.sprite_counter(0), 0x3F);
    }

    #[test]
    fn test_register_round_trip_and_unused() {
        let (_sched, vic, _) = pal();
        let mut v = vic.borrow_mut();

        v.write(0x20, 0x0E);
        assert_eq!(v.read(0x20), 0x0E);
        v.write(0x00, 0xA5);
        assert_eq!(v.read(0x00), 0xA5);

        for addr in 0x2F..=0x3F {
            v.write(addr, 0x12);
            assert_eq!(v.read(addr), 0xFF);
        }

        v.write(0x40, 0x55);
        assert_eq!(v.read(0x40), 0);
        assert_eq!(v.read(REG_IRQ_MASK), 0xF0);
    }

    #[test]
    fn test_lightpen_registers_are_read_only() {
        let (sched, vic, _) = pal();
        sched.run_until(line_start(100) + 20).unwrap();
        let mut v = vic.borrow_mut();
        v.write(REG_LIGHTPEN_X, 0x55);
        v.write(REG_LIGHTPEN_Y, 0x66);
        assert_eq!(v.read(REG_LIGHTPEN_X), 0);
        assert_eq!(v.read(REG_LIGHTPEN_Y), 0);
    }

    #[test]
    fn test_lightpen_latches_once_per_frame() {
        let (sched, vic, _) = pal();
        sched.run_until(line_start(100) + 20).unwrap();
        {
            let mut v = vic.borrow_mut();
            v.lightpen();
            assert_eq!(v.read(REG_LIGHTPEN_X), 80);
            assert_eq!(v.read(REG_LIGHTPEN_Y), 100);
            assert_eq!(v.irq_flags() & IRQ_LIGHTPEN, IRQ_LIGHTPEN);
        }

        sched.run_until(line_start(120) + 5).unwrap();
        {
            let mut v = vic.borrow_mut();
            v.lightpen();
            assert_eq!(v.read(REG_LIGHTPEN_Y), 100);
        }

        // Next frame re-arms it.
        sched.run_until(312 * PAL_LINE + line_start(10) + 2).unwrap();
        let mut v = vic.borrow_mut();
        v.lightpen();
        assert_eq!(v.read(REG_LIGHTPEN_Y), 10);
        assert_eq!(v.read(REG_LIGHTPEN_X), 8);
    }

    #[test]
    fn test_chip_switch_restarts_frame_without_clearing() {
        let (sched, vic, _) = pal();
        sched.run_until(line_start(40) + 3).unwrap();
        {
            let mut v = vic.borrow_mut();
            v.write(0x20, 0x07);
            v.chip(VicModel::Mos6567R8);
            assert_eq!(v.raster_y(), 262);
            assert_eq!(v.read(0x20), 0x07);
        }

        // Switched at raster_x 3: vblank 62 cycles later, line 0 one
        // cycle after that, line 1 a full NTSC line later.
        sched.run_for(2 * 65).unwrap();
        let mut v = vic.borrow_mut();
        assert_eq!(v.read(REG_RASTER), 1);
        assert_eq!(v.raster_x(), 3);
        assert_eq!(v.model(), VicModel::Mos6567R8);
    }

    #[test]
    fn test_chip_switch_keeps_elapsed_cycles() {
        let (sched, control, _) = pal();
        let switched = Mos656x::new(&sched, Box::new(RecordingSignals::default()));
        switched.borrow_mut().reset();

        // raster_x 20: the switched chip's last event ran at cycle 24
        // (raster_x 15), so it is five cycles behind here.
        sched.run_until(line_start(40) + 20).unwrap();
        {
            let mut v = switched.borrow_mut();
            v.chip(VicModel::Mos6569);
            assert_eq!(v.raster_x(), 20);
            assert_eq!(v.raster_y(), 311);
        }

        sched.run_until(line_start(40) + 120).unwrap();
        let mut c = control.borrow_mut();
        let mut v = switched.borrow_mut();
        assert_eq!(c.read(REG_RASTER), 41);
        assert_eq!(v.read(REG_RASTER), 0);
        assert_eq!(c.raster_x(), 57);
        assert_eq!(v.raster_x(), c.raster_x());
    }

    #[test]
    fn test_bad_line_from_mid_line_control_write() {
        // In the window: DMA starts immediately.
        let (sched, vic, rec) = pal();
        vic.borrow_mut().write(REG_CONTROL_1, 0x10);
        sched.run_until(line_start(0x33) + 30).unwrap();
        rec.take();
        {
            let mut v = vic.borrow_mut();
            assert!(!v.is_bad_line());
            v.write(REG_CONTROL_1, 0x13);
            assert!(v.is_bad_line());
            assert!(!v.bus_granted());
        }
        assert_eq!(rec.take(), vec![Signal::Bus(false)]);

        // Before cycle 20: the write only sets YSCROLL, the line's own
        // check picks it up.
        let (sched, vic, rec) = pal();
        vic.borrow_mut().write(REG_CONTROL_1, 0x10);
        sched.run_until(line_start(0x33) + 5).unwrap();
        rec.take();
        {
            let mut v = vic.borrow_mut();
            v.write(REG_CONTROL_1, 0x13);
            assert!(!v.is_bad_line());
            assert!(v.bus_granted());
        }
        assert!(rec.take().is_empty());
        sched.run_for(10).unwrap();
        assert_eq!(rec.take(), vec![Signal::Bus(false)]);

        // Past cycle 62: bad line latched, bus left alone.
        let (sched, vic, rec) = pal();
        vic.borrow_mut().write(REG_CONTROL_1, 0x10);
        sched.run_until(line_start(0x33) + 55).unwrap();
        rec.take();
        {
            let mut v = vic.borrow_mut();
            v.write(REG_CONTROL_1, 0x13);
            assert!(v.is_bad_line());
            assert!(v.bus_granted());
        }
        assert!(rec.take().is_empty());
    }

    #[test]
    fn test_ntsc_bad_line_regrants_on_cycle_63() {
        let sched = Rc::new(EventScheduler::new());
        let rec = RecordingSignals::default();
        let vic = Mos656x::new(&sched, Box::new(rec.clone()));
        {
            let mut v = vic.borrow_mut();
            v.chip(VicModel::Mos6567R8);
            v.reset();
            v.write(REG_CONTROL_1, 0x10);
        }

        // Line 0x30 steps at 49 * 65; cycle 63 sits at raster_x 54.
        let line = 49 * 65;
        sched.run_until(line).unwrap();
        rec.take();

        sched.run_until(line + 54).unwrap();
        assert_eq!(rec.take(), vec![Signal::Bus(false)]);
        assert!(!vic.borrow().bus_granted());

        sched.run_for(1).unwrap();
        assert_eq!(rec.take(), vec![Signal::Bus(true)]);
        let v = vic.borrow();
        assert_eq!(v.raster_x(), 54);
        assert_eq!(v.raster_y(), 0x30);
    }

    #[test]
    fn test_ntsc_frame_length() {
        let sched = Rc::new(EventScheduler::new());
        let rec = RecordingSignals::default();
        let vic = Mos656x::new(&sched, Box::new(rec.clone()));
        {
            let mut v = vic.borrow_mut();
            v.chip(VicModel::Mos6567R8);
            v.reset();
            v.write(REG_IRQ_MASK, IRQ_RASTER);
        }
        let frame = VicModel::Mos6567R8.cycles_per_frame();
        assert_eq!(frame, 263 * 65);

        sched.run_for(frame * 4).unwrap();
        // One line-0 IRQ per frame, but never acknowledged: only one edge.
        assert_eq!(rec.irq_edges(), 1);
        assert!(vic.borrow().raster_y() < 263);
    }

    #[test]
    fn test_model_names_in_json() {
        let m: VicModel = serde_json::from_str("\"pal\"").unwrap();
        assert_eq!(m, VicModel::Mos6569);
        let m: VicModel = serde_json::from_str("\"mos6567r8\"").unwrap();
        assert_eq!(m, VicModel::Mos6567R8);
        assert_eq!(
            serde_json::to_string(&VicModel::Mos6567R56A).unwrap(),
            "\"mos6567r56a\""
        );
    }

    #[test]
    fn test_dropped_chip_leaves_nothing_pending() {
        let (sched, vic, _) = pal();
        let id = vic.borrow().event_id();
        assert!(sched.is_pending(id));
        drop(vic);
        assert!(!sched.is_pending(id));
        sched.run_for(1_000).unwrap();
    }
}
