//! `basalt-wheel`: a deadline timer wheel with O(1) schedule and cancel.
//!
//! Timers are absolute deadlines hashed onto a circular array of spokes;
//! polling is O(ticks advanced + timers expired) with at most one tick of
//! progress per call. The wheel never reads a clock: callers pass `now`
//! from whatever monotonic source drives their duty cycle, which is also
//! what makes behaviour fully deterministic under test.
//!
//! See [`DeadlineTimerWheel`] for the API and an example.

mod wheel;

pub use wheel::{
    DeadlineTimerWheel, TimeUnit, TimerWheelError, INITIAL_TICK_ALLOCATION, NULL_DEADLINE,
};
