//! Commodore 64 chipset timing core.
//!
//! Modelled on the libsidplayfp event scheduler and VIC-II.
//! CPU is delegated to the `mos6502` crate; the VIC-II only reaches it
//! through the AEC and IRQ lines in [`signals`].

pub mod c64;
pub mod cpu;
pub mod event;
pub mod signals;
pub mod vic_ii;
