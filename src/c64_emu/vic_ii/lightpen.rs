//! VIC-II lightpen latch.

pub struct Lightpen {
    lpx: u8,
    lpy: u8,
    is_triggered: bool,
}

impl Lightpen {
    pub fn new() -> Self {
        Self {
            lpx: 0,
            lpy: 0,
            is_triggered: false,
        }
    }

    pub fn reset(&mut self) {
        self.lpx = 0;
        self.lpy = 0;
        self.is_triggered = false;
    }

    pub fn get_x(&self) -> u8 {
        self.lpx
    }

    pub fn get_y(&self) -> u8 {
        self.lpy
    }

    /// Latch the raster position.  Only the first trigger per frame counts;
    /// returns whether this one did.
    ///
    /// X is the cycle within the line in units of 4 pixels, truncated to
    /// 8 bits the way the register is.
    pub fn trigger(&mut self, raster_x: u32, raster_y: u32) -> bool {
        if self.is_triggered {
            return false;
        }
        self.is_triggered = true;
        self.lpx = (raster_x << 2) as u8;
        self.lpy = raster_y as u8;
        true
    }

    /// Re-arm at the start of a frame.  The latched values stay readable.
    pub fn untrigger(&mut self) {
        self.is_triggered = false;
    }
}

impl Default for Lightpen {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_once_per_frame() {
        let mut lp = Lightpen::new();
        assert!(lp.trigger(20, 100));
        assert_eq!((lp.get_x(), lp.get_y()), (80, 100));
        assert!(!lp.trigger(30, 120));
        assert_eq!((lp.get_x(), lp.get_y()), (80, 100));
        lp.untrigger();
        assert!(lp.trigger(30, 0x120));
        assert_eq!((lp.get_x(), lp.get_y()), (120, 0x20));
    }

    #[test]
    fn test_x_wraps_at_eight_bits() {
        let mut lp = Lightpen::new();
        lp.trigger(64, 0);
        assert_eq!(lp.get_x(), 0);
    }
}
