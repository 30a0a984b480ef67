/// Stable name of one exported value, shared by the bridge and the metrics.
#[derive(Debug, Clone, Copy)]
pub struct Tag {
    pub key: &'static str,
    pub metric: &'static str,
    pub help: &'static str,
}

pub const CYCLE_JITTER_US: Tag = Tag {
    key: "cycle_jitter_us",
    metric: "millguard_cycle_jitter_microseconds",
    help: "Lateness of servo cycle start in microseconds",
};

pub const CYCLE_COUNT: Tag = Tag {
    key: "cycle_count",
    metric: "millguard_cycles_total",
    help: "Servo cycles executed",
};

pub const TIMESTAMP_US: Tag = Tag {
    key: "timestamp_us",
    metric: "millguard_timestamp_us",
    help: "Monotonic time of the last snapshot",
};

pub const MACHINE_ON: Tag = Tag {
    key: "machine_on",
    metric: "millguard_machine_on",
    help: "Machine power state (1 = on)",
};

pub const OILER_PHASE: Tag = Tag {
    key: "phase",
    metric: "millguard_oiler_phase",
    help: "Oiler phase (0 = idle, 1 = pumping, 2 = lockout)",
};

pub const OILER_PUMP: Tag = Tag {
    key: "pump",
    metric: "millguard_oiler_pump",
    help: "Lubrication pump command (1 = on)",
};

pub const OILER_DISTANCE: Tag = Tag {
    key: "distance",
    metric: "millguard_oiler_distance_accumulated",
    help: "Distance travelled since the last lubrication",
};

pub const OILER_MOTION_TIME: Tag = Tag {
    key: "motion_time_s",
    metric: "millguard_oiler_motion_time_seconds",
    help: "Motion time since the last lubrication",
};

pub const OILER_PHASE_REMAINING: Tag = Tag {
    key: "phase_remaining_s",
    metric: "millguard_oiler_phase_remaining_seconds",
    help: "Time left in the pumping or lockout phase",
};

pub const OILER_PUMP_CYCLES: Tag = Tag {
    key: "pump_cycles",
    metric: "millguard_oiler_pump_cycles_total",
    help: "Lubrication pulses started",
};

pub const IDLE_ELAPSED: Tag = Tag {
    key: "idle_elapsed_s",
    metric: "millguard_idle_elapsed_seconds",
    help: "Continuous inactivity while powered",
};

pub const IDLE_SHUTDOWN: Tag = Tag {
    key: "shutdown",
    metric: "millguard_idle_shutdown",
    help: "Machine-off request asserted (1 = yes)",
};

pub const IDLE_TIMEOUT: Tag = Tag {
    key: "timeout_s",
    metric: "millguard_idle_timeout_seconds",
    help: "Configured inactivity timeout",
};

pub const IDLE_SHUTDOWN_REQUESTS: Tag = Tag {
    key: "shutdown_requests",
    metric: "millguard_idle_shutdown_requests_total",
    help: "Idle timeouts that requested machine-off",
};

pub const OILER_TAGS: &[Tag] = &[
    OILER_PHASE,
    OILER_PUMP,
    OILER_DISTANCE,
    OILER_MOTION_TIME,
    OILER_PHASE_REMAINING,
    OILER_PUMP_CYCLES,
];

pub const IDLE_TAGS: &[Tag] = &[
    IDLE_ELAPSED,
    IDLE_SHUTDOWN,
    IDLE_TIMEOUT,
    IDLE_SHUTDOWN_REQUESTS,
];
