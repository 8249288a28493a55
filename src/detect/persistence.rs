/// Bounded up/down counter that debounces per-frame detections.
///
/// A hit increments, a miss decrements, both clamped to `0..=cap`. One missed
/// frame therefore only lowers the counter by one instead of dropping an
/// ongoing detection back to zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Persistence {
    value: u32,
    cap: u32,
}

impl Persistence {
    pub fn new(cap: u32) -> Self {
        Self { value: 0, cap }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn cap(&self) -> u32 {
        self.cap
    }

    pub fn observe(&mut self, hit: bool) -> u32 {
        self.value = if hit {
            (self.value + 1).min(self.cap)
        } else {
            self.value.saturating_sub(1)
        };
        self.value
    }

    pub fn reset(&mut self) {
        self.value = 0;
    }
}
