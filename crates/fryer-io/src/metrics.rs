//! Prometheus metrics for the fryer controller.
//!
//! Process values are gauges named after their `fryer_core::tags` entry;
//! event totals are counters fed from the snapshot by [`MetricsCursor`].

use fryer_core::{tags, BasketPosition, FryerSnapshot, LinkHealth, TickStats};
use prometheus::{Encoder, Gauge, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Header, Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn gauge(name: &str, help: &str) -> Gauge {
    let gauge = Gauge::new(name, help).expect("valid gauge definition");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("gauge registered once");
    gauge
}

fn counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid counter definition");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("counter registered once");
    counter
}

fn tag_gauge(tag: tags::Tag) -> Gauge {
    gauge(tag.metric, tag.help)
}

// ============================================================================
// Process state
// ============================================================================

pub static OIL_TEMP_C: LazyLock<Gauge> = LazyLock::new(|| tag_gauge(tags::OIL_TEMP_C));
pub static TARGET_TEMP_C: LazyLock<Gauge> = LazyLock::new(|| tag_gauge(tags::TARGET_TEMP_C));
pub static ELEMENT1_ON: LazyLock<Gauge> = LazyLock::new(|| tag_gauge(tags::ELEMENT1_ON));
pub static ELEMENT2_ON: LazyLock<Gauge> = LazyLock::new(|| tag_gauge(tags::ELEMENT2_ON));
pub static BASKET_POSITION: LazyLock<Gauge> =
    LazyLock::new(|| tag_gauge(tags::BASKET_POSITION));
pub static FRY_PHASE: LazyLock<Gauge> = LazyLock::new(|| tag_gauge(tags::FRY_PHASE));
pub static LINK_CONNECTED: LazyLock<Gauge> = LazyLock::new(|| tag_gauge(tags::LINK_CONNECTED));
pub static EMERGENCY_LATCHED: LazyLock<Gauge> =
    LazyLock::new(|| tag_gauge(tags::EMERGENCY_LATCHED));

/// Bridge client connection status (1 = connected, 0 = disconnected)
pub static BRIDGE_CONNECTED: LazyLock<Gauge> = LazyLock::new(|| {
    gauge(
        "fryer_bridge_connected",
        "Bridge client connection status (1=connected, 0=disconnected)",
    )
});

// ============================================================================
// Control loop
// ============================================================================

pub static TICKS_TOTAL: LazyLock<IntCounter> =
    LazyLock::new(|| counter("fryer_ticks_total", "Control ticks executed"));

pub static TICK_OVERRUNS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "fryer_tick_overruns_total",
        "Control ticks started more than one interval late",
    )
});

pub static TICK_JITTER_US: LazyLock<Histogram> = LazyLock::new(|| {
    let histogram = Histogram::with_opts(
        HistogramOpts::new(tags::TICK_JITTER_US.metric, tags::TICK_JITTER_US.help).buckets(vec![
            100.0, 500.0, 1_000.0, 5_000.0, 10_000.0, 50_000.0, 100_000.0, 500_000.0,
        ]),
    )
    .expect("valid histogram definition");
    REGISTRY
        .register(Box::new(histogram.clone()))
        .expect("histogram registered once");
    histogram
});

// ============================================================================
// Serial link
// ============================================================================

pub static COMMANDS_SENT: LazyLock<IntCounter> =
    LazyLock::new(|| counter("fryer_commands_sent_total", "Serial commands written"));

pub static COMMAND_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "fryer_command_failures_total",
        "Serial commands that failed after all retries",
    )
});

pub static PARSE_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "fryer_telemetry_parse_failures_total",
        "Telemetry lines without a temperature reading",
    )
});

// ============================================================================
// Fry cycles
// ============================================================================

pub static CYCLES_COMPLETED: LazyLock<IntCounter> =
    LazyLock::new(|| counter("fryer_cycles_completed_total", "Fry cycles completed"));

pub static CYCLES_ABORTED: LazyLock<IntCounter> =
    LazyLock::new(|| counter("fryer_cycles_aborted_total", "Fry cycles aborted"));

pub static EMERGENCY_STOPS: LazyLock<IntCounter> =
    LazyLock::new(|| counter("fryer_emergency_stops_total", "Emergency stops latched"));

pub static BRIDGE_REJECTED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "fryer_bridge_rejected_total",
        "Bridge messages answered with an error",
    )
});

fn basket_code(position: BasketPosition) -> f64 {
    match position {
        BasketPosition::Unknown => 0.0,
        BasketPosition::Raised => 1.0,
        BasketPosition::Lowered => 2.0,
    }
}

fn flag(on: bool) -> f64 {
    if on {
        1.0
    } else {
        0.0
    }
}

/// Turns the snapshot's running totals into counter increments.
#[derive(Debug, Default)]
pub struct MetricsCursor {
    ticks: u64,
    overruns: u64,
    commands_sent: u64,
    command_failures: u64,
    parse_failures: u64,
    cycles_completed: u64,
    cycles_aborted: u64,
    emergency_stops: u64,
}

fn advance(counter: &IntCounter, last: &mut u64, total: u64) {
    if total > *last {
        counter.inc_by(total - *last);
        *last = total;
    }
}

impl MetricsCursor {
    pub fn apply(&mut self, snapshot: &FryerSnapshot, stats: &TickStats) {
        OIL_TEMP_C.set(snapshot.temperature_c);
        TARGET_TEMP_C.set(snapshot.target_c.unwrap_or(0.0));
        ELEMENT1_ON.set(flag(snapshot.heating.element1));
        ELEMENT2_ON.set(flag(snapshot.heating.element2));
        BASKET_POSITION.set(basket_code(snapshot.basket));
        FRY_PHASE.set(snapshot.status.phase.code() as f64);
        LINK_CONNECTED.set(flag(snapshot.link == LinkHealth::Connected));
        EMERGENCY_LATCHED.set(flag(snapshot.emergency_latched));

        if stats.ticks > self.ticks {
            TICK_JITTER_US.observe(stats.last_jitter_us as f64);
        }
        advance(&TICKS_TOTAL, &mut self.ticks, stats.ticks);
        advance(&TICK_OVERRUNS, &mut self.overruns, stats.overruns);
        advance(
            &COMMANDS_SENT,
            &mut self.commands_sent,
            snapshot.link_stats.commands_sent,
        );
        advance(
            &COMMAND_FAILURES,
            &mut self.command_failures,
            snapshot.link_stats.send_failures,
        );
        advance(
            &PARSE_FAILURES,
            &mut self.parse_failures,
            snapshot.parse_failures,
        );
        advance(
            &CYCLES_COMPLETED,
            &mut self.cycles_completed,
            snapshot.counters.cycles_completed,
        );
        advance(
            &CYCLES_ABORTED,
            &mut self.cycles_aborted,
            snapshot.counters.cycles_aborted,
        );
        advance(
            &EMERGENCY_STOPS,
            &mut self.emergency_stops,
            snapshot.counters.emergency_stops,
        );
    }
}

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Start the metrics HTTP server on the given address.
/// Returns a join handle for the server thread.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            let path = request.url().to_string();
            let response = match path.as_str() {
                "/metrics" => {
                    let mut buffer = Vec::new();
                    match TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
                        Ok(()) => {
                            let response = Response::from_data(buffer);
                            match Header::from_bytes(
                                &b"Content-Type"[..],
                                &b"text/plain; version=0.0.4"[..],
                            ) {
                                Ok(header) => response.with_header(header),
                                Err(()) => response,
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Failed to encode metrics: {}", e);
                            Response::from_string("Internal Server Error").with_status_code(500)
                        }
                    }
                }
                "/health" => Response::from_string("OK"),
                // Ready once the control loop has ticked
                "/ready" if TICKS_TOTAL.get() > 0 => Response::from_string("Ready"),
                "/ready" => Response::from_string("Not Ready").with_status_code(503),
                _ => Response::from_string("Not Found").with_status_code(404),
            };
            let _ = request.respond(response);
        }
    })
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    for gauge in [
        &OIL_TEMP_C,
        &TARGET_TEMP_C,
        &ELEMENT1_ON,
        &ELEMENT2_ON,
        &BASKET_POSITION,
        &FRY_PHASE,
        &LINK_CONNECTED,
        &EMERGENCY_LATCHED,
        &BRIDGE_CONNECTED,
    ] {
        let _ = gauge.get();
    }
    for counter in [
        &TICKS_TOTAL,
        &TICK_OVERRUNS,
        &COMMANDS_SENT,
        &COMMAND_FAILURES,
        &PARSE_FAILURES,
        &CYCLES_COMPLETED,
        &CYCLES_ABORTED,
        &EMERGENCY_STOPS,
        &BRIDGE_REJECTED,
    ] {
        let _ = counter.get();
    }
    let _ = TICK_JITTER_US.get_sample_count();
}
