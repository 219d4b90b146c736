// Time source for the board main loop
//
// Microcontroller timers wrap, so time is a free-running u32 and consumers
// compare readings themselves.

pub trait Clock {
    /// Microseconds since an arbitrary start, wrapping at u32::MAX
    fn micros(&self) -> u32;

    fn millis(&self) -> u32 {
        self.micros() / 1000
    }
}
