//! Hierarchical deadline timer wheel.
//!
//! Deadlines hash into the spoke for their tick; each spoke owns a
//! contiguous run of 64-bit deadline cells inside one flat allocation, so
//! scheduling is a write into an empty cell and cancellation is a write
//! of the null sentinel. Polling drains the current spoke then advances
//! the tick, at most one tick per call, so a caller that fell behind
//! catches up with bounded work per poll.
//!
//! A timer id encodes `(spoke index, cell index)` in its high/low 32
//! bits. Ids stay valid across spoke growth because expansion doubles
//! every spoke's cell run in place, preserving each `(spoke, cell)`
//! coordinate.
//!
//! Deadlines further out than one wheel revolution simply wait in their
//! spoke: the stored deadline itself gates expiry, so they fire in the
//! correct round.
//!
//! The wheel is single-threaded; callers drive it with their own clock
//! readings, which keeps it free of clock syscalls and trivially
//! testable.

/// Sentinel deadline for an empty cell.
pub const NULL_DEADLINE: i64 = -1;

/// Default number of deadline cells allocated per spoke.
pub const INITIAL_TICK_ALLOCATION: usize = 16;

/// Hard ceiling on the flat wheel allocation, in cells.
const MAX_WHEEL_CAPACITY: usize = 1 << 30;

/// The unit in which a wheel's times are expressed; delivered to expiry
/// handlers so shared handler code can convert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

impl TimeUnit {
    /// Nanoseconds in one unit.
    pub const fn nanos_per_unit(self) -> i64 {
        match self {
            TimeUnit::Nanoseconds => 1,
            TimeUnit::Microseconds => 1_000,
            TimeUnit::Milliseconds => 1_000_000,
            TimeUnit::Seconds => 1_000_000_000,
        }
    }
}

/// Errors raised by wheel construction and mutation.
#[derive(Debug, thiserror::Error)]
pub enum TimerWheelError {
    #[error("{name} must be a positive power of two, got {value}")]
    NotPowerOfTwo { name: &'static str, value: i64 },

    #[error("max wheel capacity reached at tick_allocation={tick_allocation}")]
    Overflow { tick_allocation: usize },

    #[error("cannot reset start time while {live} timers are active")]
    TimersActive { live: u64 },
}

#[inline(always)]
const fn timer_id_for_slot(spoke_index: usize, cell_index: usize) -> i64 {
    ((spoke_index as i64) << 32) | cell_index as i64
}

#[inline(always)]
const fn spoke_for_timer_id(timer_id: i64) -> usize {
    (timer_id >> 32) as usize
}

#[inline(always)]
const fn cell_for_timer_id(timer_id: i64) -> usize {
    timer_id as u32 as usize
}

/// A deadline timer wheel with O(1) schedule and cancel.
///
/// # Example
///
/// ```
/// use basalt_wheel::{DeadlineTimerWheel, TimeUnit};
///
/// let mut wheel = DeadlineTimerWheel::new(TimeUnit::Milliseconds, 0, 16, 256)?;
/// let id = wheel.schedule_timer(100)?;
///
/// let mut fired = Vec::new();
/// let mut now = 0;
/// while fired.is_empty() {
///     now += wheel.tick_resolution();
///     wheel.poll(now, |_, now, timer_id| {
///         fired.push((now, timer_id));
///         true
///     }, usize::MAX);
/// }
/// assert_eq!(fired, vec![(112, id)]); // next tick edge at or after 100
/// # Ok::<(), basalt_wheel::TimerWheelError>(())
/// ```
pub struct DeadlineTimerWheel {
    time_unit: TimeUnit,
    tick_resolution: i64,
    start_time: i64,
    current_tick: i64,
    timer_count: u64,
    ticks_per_wheel: usize,
    wheel_mask: i64,
    resolution_bits_to_shift: u32,
    tick_allocation: usize,
    allocation_bits_to_shift: u32,
    poll_index: usize,
    wheel: Vec<i64>,
}

impl DeadlineTimerWheel {
    /// A wheel with the default per-spoke allocation of
    /// [`INITIAL_TICK_ALLOCATION`] cells.
    ///
    /// `tick_resolution` (in `time_unit`) and `ticks_per_wheel` must be
    /// positive powers of two.
    pub fn new(
        time_unit: TimeUnit,
        start_time: i64,
        tick_resolution: i64,
        ticks_per_wheel: usize,
    ) -> Result<Self, TimerWheelError> {
        Self::with_tick_allocation(
            time_unit,
            start_time,
            tick_resolution,
            ticks_per_wheel,
            INITIAL_TICK_ALLOCATION,
        )
    }

    /// A wheel with an explicit initial per-spoke allocation (a positive
    /// power of two). Spokes grow by doubling when they fill.
    pub fn with_tick_allocation(
        time_unit: TimeUnit,
        start_time: i64,
        tick_resolution: i64,
        ticks_per_wheel: usize,
        initial_tick_allocation: usize,
    ) -> Result<Self, TimerWheelError> {
        check_power_of_two("ticks_per_wheel", ticks_per_wheel as i64)?;
        check_power_of_two("tick_resolution", tick_resolution)?;
        check_power_of_two("initial_tick_allocation", initial_tick_allocation as i64)?;

        Ok(Self {
            time_unit,
            tick_resolution,
            start_time,
            current_tick: 0,
            timer_count: 0,
            ticks_per_wheel,
            wheel_mask: ticks_per_wheel as i64 - 1,
            resolution_bits_to_shift: tick_resolution.trailing_zeros(),
            tick_allocation: initial_tick_allocation,
            allocation_bits_to_shift: initial_tick_allocation.trailing_zeros(),
            poll_index: 0,
            wheel: vec![NULL_DEADLINE; ticks_per_wheel * initial_tick_allocation],
        })
    }

    /// The unit all of this wheel's times are expressed in.
    #[inline]
    pub fn time_unit(&self) -> TimeUnit {
        self.time_unit
    }

    /// Duration of one tick.
    #[inline]
    pub fn tick_resolution(&self) -> i64 {
        self.tick_resolution
    }

    /// Number of spokes on the wheel.
    #[inline]
    pub fn ticks_per_wheel(&self) -> usize {
        self.ticks_per_wheel
    }

    /// The time the wheel's tick zero began.
    #[inline]
    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    /// Number of live timers.
    #[inline]
    pub fn timer_count(&self) -> u64 {
        self.timer_count
    }

    /// Time at which the current tick ends and the next poll may advance.
    #[inline]
    pub fn current_tick_time(&self) -> i64 {
        ((self.current_tick + 1) << self.resolution_bits_to_shift) + self.start_time
    }

    /// Advance the wheel's notion of now, rounding up to the next tick
    /// boundary. The tick never moves backwards.
    pub fn set_current_tick_time(&mut self, now: i64) {
        self.current_tick =
            ((now - self.start_time) >> self.resolution_bits_to_shift).max(self.current_tick);
    }

    /// Rebase the wheel on a new start time.
    ///
    /// # Errors
    ///
    /// [`TimerWheelError::TimersActive`] if any timer is live; existing
    /// timer deadlines would silently shift otherwise.
    pub fn reset_start_time(&mut self, start_time: i64) -> Result<(), TimerWheelError> {
        if self.timer_count > 0 {
            return Err(TimerWheelError::TimersActive {
                live: self.timer_count,
            });
        }

        self.start_time = start_time;
        self.current_tick = 0;
        self.poll_index = 0;

        Ok(())
    }

    /// Schedule a timer for `deadline`. Deadlines already in the past
    /// land in the current tick and fire on the next poll.
    ///
    /// Returns the timer id used with [`cancel_timer`](Self::cancel_timer)
    /// and reported to poll handlers.
    ///
    /// # Errors
    ///
    /// [`TimerWheelError::Overflow`] when the target spoke is full and
    /// the wheel cannot grow further.
    pub fn schedule_timer(&mut self, deadline: i64) -> Result<i64, TimerWheelError> {
        let deadline_tick = ((deadline - self.start_time) >> self.resolution_bits_to_shift)
            .max(self.current_tick);
        let spoke_index = (deadline_tick & self.wheel_mask) as usize;
        let tick_start_index = spoke_index << self.allocation_bits_to_shift;

        for cell_index in 0..self.tick_allocation {
            let index = tick_start_index + cell_index;
            if self.wheel[index] == NULL_DEADLINE {
                self.wheel[index] = deadline;
                self.timer_count += 1;

                return Ok(timer_id_for_slot(spoke_index, cell_index));
            }
        }

        self.increase_capacity(deadline, spoke_index)
    }

    /// Cancel a live timer. Returns `false` for a timer that already
    /// expired, was cancelled before, or never existed.
    pub fn cancel_timer(&mut self, timer_id: i64) -> bool {
        let spoke_index = spoke_for_timer_id(timer_id);
        let cell_index = cell_for_timer_id(timer_id);

        if spoke_index < self.ticks_per_wheel && cell_index < self.tick_allocation {
            let index = (spoke_index << self.allocation_bits_to_shift) + cell_index;
            if self.wheel[index] != NULL_DEADLINE {
                self.wheel[index] = NULL_DEADLINE;
                self.timer_count -= 1;

                return true;
            }
        }

        false
    }

    /// Poll for expired timers, up to `expiry_limit` of them.
    ///
    /// `handler(time_unit, now, timer_id)` is invoked per expiry. A
    /// `true` return consumes the expiry; `false` reinstates the timer
    /// for redelivery on a later poll, stops the drain, and the refused
    /// expiry is not counted. A panicking handler consumes its expiry.
    ///
    /// The current tick advances at most once per call, and only when
    /// `now` has reached the end of the current tick with budget to
    /// spare, so expiries are never skipped and each call's work is
    /// bounded by the spoke allocation.
    pub fn poll<F>(&mut self, now: i64, mut handler: F, expiry_limit: usize) -> usize
    where
        F: FnMut(TimeUnit, i64, i64) -> bool,
    {
        let mut timers_expired = 0;

        if self.timer_count > 0 {
            let spoke_index = (self.current_tick & self.wheel_mask) as usize;

            for _ in 0..self.tick_allocation {
                if timers_expired >= expiry_limit {
                    break;
                }

                let wheel_index = (spoke_index << self.allocation_bits_to_shift) + self.poll_index;
                let deadline = self.wheel[wheel_index];

                if deadline != NULL_DEADLINE && deadline <= now {
                    // Consume before invoking so a panicking handler
                    // cannot observe the same expiry twice.
                    self.wheel[wheel_index] = NULL_DEADLINE;
                    self.timer_count -= 1;
                    timers_expired += 1;

                    if !handler(
                        self.time_unit,
                        now,
                        timer_id_for_slot(spoke_index, self.poll_index),
                    ) {
                        self.wheel[wheel_index] = deadline;
                        self.timer_count += 1;

                        return timers_expired - 1;
                    }
                }

                self.poll_index = if self.poll_index + 1 >= self.tick_allocation {
                    0
                } else {
                    self.poll_index + 1
                };
            }

            if timers_expired < expiry_limit && now >= self.current_tick_time() {
                self.current_tick += 1;
                self.poll_index = 0;
            } else if self.poll_index >= self.tick_allocation {
                self.poll_index = 0;
            }
        } else if now >= self.current_tick_time() {
            self.current_tick += 1;
            self.poll_index = 0;
        }

        timers_expired
    }

    /// The deadline stored for `timer_id`, or [`NULL_DEADLINE`] if the
    /// timer is not live.
    pub fn deadline(&self, timer_id: i64) -> i64 {
        let spoke_index = spoke_for_timer_id(timer_id);
        let cell_index = cell_for_timer_id(timer_id);

        if spoke_index < self.ticks_per_wheel && cell_index < self.tick_allocation {
            return self.wheel[(spoke_index << self.allocation_bits_to_shift) + cell_index];
        }

        NULL_DEADLINE
    }

    /// Visit every live timer as `(deadline, timer_id)`, in unspecified
    /// order.
    pub fn for_each<F>(&self, mut consumer: F)
    where
        F: FnMut(i64, i64),
    {
        let mut timers_remaining = self.timer_count;
        if timers_remaining == 0 {
            return;
        }

        'spokes: for spoke_index in 0..self.ticks_per_wheel {
            let tick_start_index = spoke_index << self.allocation_bits_to_shift;

            for cell_index in 0..self.tick_allocation {
                let deadline = self.wheel[tick_start_index + cell_index];
                if deadline != NULL_DEADLINE {
                    consumer(deadline, timer_id_for_slot(spoke_index, cell_index));

                    timers_remaining -= 1;
                    if timers_remaining == 0 {
                        break 'spokes;
                    }
                }
            }
        }
    }

    /// Cancel everything. Idempotent.
    pub fn clear(&mut self) {
        self.wheel.fill(NULL_DEADLINE);
        self.timer_count = 0;
    }

    /// Double every spoke's cell run, preserving `(spoke, cell)`
    /// coordinates so existing timer ids remain valid, then place
    /// `deadline` in the first new cell of `spoke_index`.
    fn increase_capacity(
        &mut self,
        deadline: i64,
        spoke_index: usize,
    ) -> Result<i64, TimerWheelError> {
        let new_tick_allocation = self.tick_allocation << 1;
        let new_allocation_bits_to_shift = new_tick_allocation.trailing_zeros();
        let new_capacity = self.ticks_per_wheel << new_allocation_bits_to_shift;

        if new_capacity > MAX_WHEEL_CAPACITY {
            return Err(TimerWheelError::Overflow {
                tick_allocation: self.tick_allocation,
            });
        }

        let mut new_wheel = vec![NULL_DEADLINE; new_capacity];
        for spoke in 0..self.ticks_per_wheel {
            let old_start = spoke << self.allocation_bits_to_shift;
            let new_start = spoke << new_allocation_bits_to_shift;
            new_wheel[new_start..new_start + self.tick_allocation]
                .copy_from_slice(&self.wheel[old_start..old_start + self.tick_allocation]);
        }

        new_wheel[(spoke_index << new_allocation_bits_to_shift) + self.tick_allocation] = deadline;
        let timer_id = timer_id_for_slot(spoke_index, self.tick_allocation);
        self.timer_count += 1;

        self.tick_allocation = new_tick_allocation;
        self.allocation_bits_to_shift = new_allocation_bits_to_shift;
        self.wheel = new_wheel;

        Ok(timer_id)
    }
}

fn check_power_of_two(name: &'static str, value: i64) -> Result<(), TimerWheelError> {
    if value < 1 || value & (value - 1) != 0 {
        return Err(TimerWheelError::NotPowerOfTwo { name, value });
    }

    Ok(())
}
