//! Chip → CPU signal lines.
//!
//! A chip never calls into the CPU directly.  It only drives two
//! level signals: AEC (bus available to the CPU) and IRQ.

use std::cell::Cell;
use std::rc::Rc;

/// Callback interface a chip is constructed with.
pub trait BusSignals {
    /// `false` = the chip owns the bus (DMA), the CPU must not start a cycle.
    fn set_bus_granted(&mut self, granted: bool);

    /// Drive this chip's IRQ output.
    fn set_interrupt_asserted(&mut self, asserted: bool);
}

#[derive(Debug)]
struct LineState {
    bus_granted: Cell<bool>,
    irq_sources: Cell<u32>,
    irq_edges: Cell<u64>,
}

/// The CPU side of the lines, shared between the chips that drive them
/// and the CPU that samples them.
///
/// IRQ is wired-OR: every chip holding it low counts, and the line only
/// goes inactive once all of them have released it.
#[derive(Debug, Clone)]
pub struct CpuLines(Rc<LineState>);

impl CpuLines {
    pub fn new() -> Self {
        Self(Rc::new(LineState {
            bus_granted: Cell::new(true),
            irq_sources: Cell::new(0),
            irq_edges: Cell::new(0),
        }))
    }

    pub fn bus_granted(&self) -> bool {
        self.0.bus_granted.get()
    }

    pub fn irq_asserted(&self) -> bool {
        self.0.irq_sources.get() > 0
    }

    /// How many times the IRQ line went active.
    pub fn irq_edges(&self) -> u64 {
        self.0.irq_edges.get()
    }

    pub fn reset(&self) {
        self.0.bus_granted.set(true);
        self.0.irq_sources.set(0);
    }
}

impl Default for CpuLines {
    fn default() -> Self {
        Self::new()
    }
}

impl BusSignals for CpuLines {
    fn set_bus_granted(&mut self, granted: bool) {
        self.0.bus_granted.set(granted);
    }

    fn set_interrupt_asserted(&mut self, asserted: bool) {
        let sources = self.0.irq_sources.get();
        if asserted {
            if sources == 0 {
                self.0.irq_edges.set(self.0.irq_edges.get() + 1);
            }
            self.0.irq_sources.set(sources + 1);
        } else {
            self.0.irq_sources.set(sources.saturating_sub(1));
        }
    }
}
