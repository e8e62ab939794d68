//! End-to-end dispatch tests: handler ordering, per-entity serialisation,
//! cross-entity parallelism, halt propagation, drift detection, and crash
//! isolation.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::json;
use tessera_engine::prelude::*;

// ---------------------------------------------------------------------------
// Instrumented component types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
struct Invocation {
    alias: &'static str,
    event: String,
    entity: EntityHash,
    arg: Option<i64>,
    started: Instant,
    finished: Instant,
}

type Log = Arc<Mutex<Vec<Invocation>>>;

/// A component type that records every invocation, optionally sleeping,
/// halting, drifting, or panicking first.
struct Probe {
    alias: &'static str,
    events: Vec<EventName>,
    log: Log,
    delay: Duration,
    verdict: Flow,
    drift: bool,
    panic_on: Option<&'static str>,
}

impl Probe {
    fn new(alias: &'static str, events: &[&str], log: &Log) -> Self {
        Self {
            alias,
            events: events.iter().map(|e| (*e).to_owned()).collect(),
            log: Arc::clone(log),
            delay: Duration::ZERO,
            verdict: Flow::Continue,
            drift: false,
            panic_on: None,
        }
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn halting(mut self) -> Self {
        self.verdict = Flow::Halt;
        self
    }

    fn drifting(mut self) -> Self {
        self.drift = true;
        self
    }

    fn panic_on(mut self, event: &'static str) -> Self {
        self.panic_on = Some(event);
        self
    }
}

impl ComponentType for Probe {
    fn name(&self) -> &str {
        self.alias
    }

    fn events(&self) -> Vec<EventName> {
        self.events.clone()
    }

    fn handle_event(&self, name: &str, mut event: Event) -> Option<(Flow, Event)> {
        if self.panic_on == Some(name) {
            panic!("probe '{}' exploded on '{name}'", self.alias);
        }
        let started = Instant::now();
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        if self.drift {
            event.timestamp = event.timestamp.wrapping_add(1);
        }
        self.log.lock().push(Invocation {
            alias: self.alias,
            event: name.to_owned(),
            entity: event.entity.hash(),
            arg: event.args.get("i").and_then(|v| v.as_i64()),
            started,
            finished: Instant::now(),
        });
        Some((self.verdict, event))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn world_with(kinds: Vec<Arc<dyn ComponentType>>) -> World {
    let registry = Arc::new(Registry::new());
    registry.register_components(kinds).unwrap();
    World::new(registry)
}

fn attach(world: &World, entity: &Entity, alias: &str) {
    let registered = world.registry().lookup(alias).unwrap();
    world
        .context()
        .emplace(entity, registered.new_component(&json!({})))
        .unwrap();
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    done()
}

// ---------------------------------------------------------------------------
// Handler ordering
// ---------------------------------------------------------------------------

#[test]
fn handlers_fire_in_registration_order() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let world = world_with(vec![
        Arc::new(Probe::new("ping", &["check"], &log)),
        Arc::new(Probe::new("pong", &["check"], &log)),
    ]);

    let entity = world.create().unwrap();
    attach(&world, &entity, "ping");
    attach(&world, &entity, "pong");

    world.send(&entity, "check", PropMap::new()).unwrap();
    world.flush(Duration::from_secs(5)).unwrap();

    let aliases: Vec<&str> = log.lock().iter().map(|i| i.alias).collect();
    assert_eq!(aliases, vec!["ping", "pong"]);
}

#[test]
fn handler_list_is_filtered_to_attached_types() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let world = world_with(vec![
        Arc::new(Probe::new("ping", &["check"], &log)),
        Arc::new(Probe::new("pong", &["check"], &log)),
    ]);

    let entity = world.create().unwrap();
    attach(&world, &entity, "pong");

    world.send(&entity, "check", PropMap::new()).unwrap();
    world.flush(Duration::from_secs(5)).unwrap();

    let aliases: Vec<&str> = log.lock().iter().map(|i| i.alias).collect();
    assert_eq!(aliases, vec!["pong"]);
}

// ---------------------------------------------------------------------------
// Per-entity FIFO
// ---------------------------------------------------------------------------

#[test]
fn events_to_one_entity_are_handled_in_send_order() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let world = world_with(vec![Arc::new(Probe::new("seq", &["step"], &log))]);

    let entity = world.create().unwrap();
    attach(&world, &entity, "seq");

    for i in 0..50i64 {
        let mut args = PropMap::new();
        args.insert("i".to_owned(), json!(i));
        world.send(&entity, "step", args).unwrap();
    }
    world.flush(Duration::from_secs(10)).unwrap();

    let observed: Vec<i64> = log.lock().iter().filter_map(|i| i.arg).collect();
    let expected: Vec<i64> = (0..50).collect();
    assert_eq!(observed, expected);
}

#[test]
fn a_second_event_starts_after_the_first_finishes() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let world = world_with(vec![Arc::new(
        Probe::new("sleeper", &["ping", "pong"], &log).delay(Duration::from_millis(50)),
    )]);

    let entity = world.create().unwrap();
    attach(&world, &entity, "sleeper");

    world.send(&entity, "ping", PropMap::new()).unwrap();
    world.send(&entity, "pong", PropMap::new()).unwrap();
    world.flush(Duration::from_secs(5)).unwrap();

    let log = log.lock();
    let ping = log.iter().find(|i| i.event == "ping").unwrap();
    let pong = log.iter().find(|i| i.event == "pong").unwrap();
    assert!(
        pong.started >= ping.finished,
        "pong started before ping completed"
    );
}

// ---------------------------------------------------------------------------
// Cross-entity parallelism
// ---------------------------------------------------------------------------

#[test]
fn a_blocked_entity_does_not_stall_the_others() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let world = world_with(vec![
        Arc::new(Probe::new("ping", &["check", "stall"], &log).delay(Duration::from_millis(1))),
        Arc::new(Probe::new("pong", &["check"], &log)),
        Arc::new(Probe::new("anchor", &["stall"], &log).delay(Duration::from_secs(3))),
    ]);

    let blocked = world.create().unwrap();
    attach(&world, &blocked, "anchor");
    let free = world.create().unwrap();
    attach(&world, &free, "ping");
    attach(&world, &free, "pong");

    // Block the first entity's lane, then send to the second.
    world.send(&blocked, "stall", PropMap::new()).unwrap();
    world.send(&free, "check", PropMap::new()).unwrap();

    let free_hash = free.hash();
    let completed = wait_until(Duration::from_secs(2), || {
        log.lock().iter().filter(|i| i.entity == free_hash).count() == 2
    });
    assert!(completed, "the unblocked entity made no progress");
    // The anchor is still sleeping.
    assert!(log.lock().iter().all(|i| i.alias != "anchor"));
}

// ---------------------------------------------------------------------------
// Halt
// ---------------------------------------------------------------------------

#[test]
fn halt_skips_later_handlers_for_that_event_only() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let world = world_with(vec![
        Arc::new(Probe::new("gate", &["stop", "go"], &log).halting()),
        Arc::new(Probe::new("after", &["stop", "go"], &log)),
    ]);

    let entity = world.create().unwrap();
    attach(&world, &entity, "gate");
    attach(&world, &entity, "after");

    world.send(&entity, "stop", PropMap::new()).unwrap();
    world.send(&entity, "go", PropMap::new()).unwrap();
    world.flush(Duration::from_secs(5)).unwrap();

    let pairs: Vec<(&str, String)> = log
        .lock()
        .iter()
        .map(|i| (i.alias, i.event.clone()))
        .collect();
    // "stop" halts after the gate; "go" still reaches both handlers.
    assert_eq!(
        pairs,
        vec![
            ("gate", "stop".to_owned()),
            ("gate", "go".to_owned()),
            ("after", "go".to_owned()),
        ]
    );
}

// ---------------------------------------------------------------------------
// Drift detection
// ---------------------------------------------------------------------------

#[test]
fn drift_aborts_the_rest_of_the_handler_chain() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let world = world_with(vec![
        Arc::new(Probe::new("drifter", &["check"], &log).drifting()),
        Arc::new(Probe::new("witness", &["check"], &log)),
    ]);

    let entity = world.create().unwrap();
    attach(&world, &entity, "drifter");
    attach(&world, &entity, "witness");

    world.send(&entity, "check", PropMap::new()).unwrap();
    // The worker dies on the drift check, but its ack and completion still
    // arrive, so flush drains.
    world.flush(Duration::from_secs(5)).unwrap();

    let aliases: Vec<&str> = log.lock().iter().map(|i| i.alias).collect();
    assert_eq!(aliases, vec!["drifter"]);
}

// ---------------------------------------------------------------------------
// Crash isolation
// ---------------------------------------------------------------------------

#[test]
fn a_crashing_handler_frees_the_entity_lane() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let world = world_with(vec![Arc::new(
        Probe::new("fragile", &["boom", "check"], &log).panic_on("boom"),
    )]);

    let entity = world.create().unwrap();
    attach(&world, &entity, "fragile");

    world.send(&entity, "boom", PropMap::new()).unwrap();
    // Drain the crash first so the second event gets its own batch; a crash
    // abandons whatever remained of the batch it was in.
    world.flush(Duration::from_secs(5)).unwrap();
    world.send(&entity, "check", PropMap::new()).unwrap();
    world.flush(Duration::from_secs(5)).unwrap();

    // The crash consumed "boom"; "check" was handled afterwards.
    let events: Vec<String> = log.lock().iter().map(|i| i.event.clone()).collect();
    assert_eq!(events, vec!["check".to_owned()]);
}

#[test]
fn a_crash_does_not_disturb_other_entities() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let world = world_with(vec![
        Arc::new(Probe::new("fragile", &["boom"], &log).panic_on("boom")),
        Arc::new(Probe::new("steady", &["tick"], &log)),
    ]);

    let doomed = world.create().unwrap();
    attach(&world, &doomed, "fragile");
    let healthy = world.create().unwrap();
    attach(&world, &healthy, "steady");

    world.send(&doomed, "boom", PropMap::new()).unwrap();
    for _ in 0..10 {
        world.send(&healthy, "tick", PropMap::new()).unwrap();
    }
    world.flush(Duration::from_secs(5)).unwrap();

    assert_eq!(log.lock().iter().filter(|i| i.alias == "steady").count(), 10);
}

// ---------------------------------------------------------------------------
// Args transformation
// ---------------------------------------------------------------------------

#[test]
fn handlers_transform_args_down_the_chain() {
    struct Halver {
        seen: Arc<Mutex<Vec<i64>>>,
        alias: &'static str,
    }

    impl ComponentType for Halver {
        fn name(&self) -> &str {
            self.alias
        }

        fn events(&self) -> Vec<EventName> {
            vec!["damage".to_owned()]
        }

        fn handle_event(&self, _name: &str, mut event: Event) -> Option<(Flow, Event)> {
            let amount = event.args.get("amount").and_then(|v| v.as_i64()).unwrap();
            self.seen.lock().push(amount);
            event.args.insert("amount".to_owned(), json!(amount / 2));
            Some((Flow::Continue, event))
        }
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let world = world_with(vec![
        Arc::new(Halver {
            seen: Arc::clone(&seen),
            alias: "armor",
        }) as Arc<dyn ComponentType>,
        Arc::new(Halver {
            seen: Arc::clone(&seen),
            alias: "shield",
        }),
    ]);

    let entity = world.create().unwrap();
    attach(&world, &entity, "armor");
    attach(&world, &entity, "shield");

    let mut args = PropMap::new();
    args.insert("amount".to_owned(), json!(8));
    world.send(&entity, "damage", args).unwrap();
    world.flush(Duration::from_secs(5)).unwrap();

    // The first handler saw 8 and passed on 4.
    assert_eq!(*seen.lock(), vec![8, 4]);
}
