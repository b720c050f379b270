/// Names under which one process value is exported.
#[derive(Debug, Clone, Copy)]
pub struct Tag {
    pub key: &'static str,
    pub metric: &'static str,
    pub help: &'static str,
}

pub const OIL_TEMP_C: Tag = Tag {
    key: "temperature_c",
    metric: "fryer_oil_temperature_celsius",
    help: "Oil temperature in Celsius",
};

pub const TARGET_TEMP_C: Tag = Tag {
    key: "target_c",
    metric: "fryer_target_temperature_celsius",
    help: "Active heating target in Celsius (0 when idle)",
};

pub const ELEMENT1_ON: Tag = Tag {
    key: "element1",
    metric: "fryer_element1_on",
    help: "Heating element 1 energized (1=on, 0=off)",
};

pub const ELEMENT2_ON: Tag = Tag {
    key: "element2",
    metric: "fryer_element2_on",
    help: "Heating element 2 energized (1=on, 0=off)",
};

pub const BASKET_POSITION: Tag = Tag {
    key: "basket",
    metric: "fryer_basket_position",
    help: "Basket position (0=unknown, 1=raised, 2=lowered)",
};

pub const FRY_PHASE: Tag = Tag {
    key: "phase",
    metric: "fryer_phase",
    help: "Fry phase (0=idle,1=heating,2=lowering,3=frying,4=raising,5=done,6=aborted)",
};

pub const LINK_CONNECTED: Tag = Tag {
    key: "link",
    metric: "fryer_serial_connected",
    help: "Serial link status (1=connected, 0=disconnected)",
};

pub const EMERGENCY_LATCHED: Tag = Tag {
    key: "emergency_latched",
    metric: "fryer_emergency_latched",
    help: "Emergency stop latched (1=latched)",
};

pub const TICK_JITTER_US: Tag = Tag {
    key: "tick_jitter_us",
    metric: "fryer_tick_jitter_microseconds",
    help: "Control tick start delay in microseconds",
};

pub const ALL: [Tag; 9] = [
    OIL_TEMP_C,
    TARGET_TEMP_C,
    ELEMENT1_ON,
    ELEMENT2_ON,
    BASKET_POSITION,
    FRY_PHASE,
    LINK_CONNECTED,
    EMERGENCY_LATCHED,
    TICK_JITTER_US,
];
