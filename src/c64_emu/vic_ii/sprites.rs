//! Sprite DMA handling for VIC-II.
//!
//! Only what decides *when* sprite data is fetched: the per-sprite DMA
//! flag, the Y-expansion flip-flop and the 6-bit DMA counter (MCBASE).
//! Numbers in comments refer to section 3.8.1 of the VIC-II article.

pub const NUM_SPRITES: usize = 8;

/// Counter value at which a sprite has fetched all 21 lines.
const MC_DONE: u8 = 0x3F;

pub struct Sprites {
    pub dma: u8,
    expand_y: u8,
    mc_base: [u8; NUM_SPRITES],
}

impl Sprites {
    pub fn new() -> Self {
        Self {
            dma: 0,
            expand_y: 0xFF,
            mc_base: [0; NUM_SPRITES],
        }
    }

    pub fn reset(&mut self) {
        self.dma = 0;
        self.expand_y = 0xFF;
        self.mc_base.fill(0);
    }

    pub fn expand_y(&self) -> u8 {
        self.expand_y
    }

    pub fn counter(&self, sprite: usize) -> u8 {
        self.mc_base[sprite]
    }

    /// Cycle 0: flip the expansion flip-flops and start DMA for every
    /// enabled sprite whose Y coordinate matches the raster line.
    ///
    /// `regs` is the VIC register file (Y coordinates live at odd addresses).
    pub fn begin_line(&mut self, raster_y: u8, regs: &[u8; 0x40]) {
        let enable = regs[0x15];
        let y_expansion = regs[0x17];

        // 3.8.1-2
        self.expand_y ^= y_expansion;

        // 3.8.1-3
        let mut mask: u8 = 1;
        for i in 0..NUM_SPRITES {
            if (enable & mask != 0) && raster_y == regs[(i << 1) + 1] && (self.dma & mask == 0) {
                self.dma |= mask;
                self.mc_base[i] = 0;
                self.expand_y &= !(y_expansion & mask);
            }
            mask <<= 1;
        }
    }

    /// Cycle 23: first half of the counter step (3.8.1-7).
    pub fn advance_expanded(&mut self) {
        let mut mask: u8 = 1;
        for mc in &mut self.mc_base {
            if self.expand_y & mask != 0 {
                *mc = mc.wrapping_add(2);
            }
            mask <<= 1;
        }
    }

    /// Cycle 24: second half of the counter step, then retire every sprite
    /// whose counter has reached the end (3.8.1-8).
    pub fn advance_and_retire(&mut self) {
        let mut mask: u8 = 1;
        for mc in &mut self.mc_base {
            if self.expand_y & mask != 0 {
                *mc = mc.wrapping_add(1);
            }
            if *mc & 0x3F == MC_DONE {
                self.dma &= !mask;
            }
            mask <<= 1;
        }
    }

    /// Write to $D017: clearing an expansion bit sets its flip-flop (3.8.1-1).
    pub fn write_y_expansion(&mut self, data: u8) {
        self.expand_y |= !data;
    }

    pub fn is_dma(&self, val: u8) -> bool {
        (self.dma & val) != 0
    }
}

impl Default for Sprites {
    fn default() -> Self {
        Self::new()
    }
}
