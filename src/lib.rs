//! Cycle-exact C64 chipset timing: a two-phase event scheduler and a
//! VIC-II raster/DMA engine that steals cycles from a host 6510.

pub mod c64_emu;
pub mod config;
