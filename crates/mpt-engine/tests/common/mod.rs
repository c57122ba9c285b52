#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use mpt_engine::{poll_until, Hardware, Ioc, IocConfig};
use mpt_sim::{SimConfig, SimIoc};

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Timeouts short enough that failure paths finish quickly against the simulator.
pub fn fast_config() -> IocConfig {
    IocConfig {
        handshake_ack_timeout_ms: 200,
        facts_timeout_ms: 200,
        init_timeout_ms: 200,
        port_enable_timeout_ms: 200,
        fw_upload_timeout_ms: 500,
        ready_timeout_ms: 500,
        operational_timeout_ms: 500,
        command_timeout_ms: 2_000,
        reset_poll_interval_ms: 1,
        reset_timeout_ms: 100,
        poll_interval_ms: 1,
        health_check_interval_ms: 10,
        ..IocConfig::default()
    }
}

pub fn new_ioc(sim: &Arc<SimIoc>, config: IocConfig) -> Ioc {
    init_tracing();
    let hw: Arc<dyn Hardware> = sim.clone();
    Ioc::new("ioc0", hw, config).unwrap()
}

/// A simulator with `sim` personality and an engine attached to it.
pub fn attach(sim: SimConfig) -> (Arc<SimIoc>, Arc<Ioc>) {
    attach_with(sim, fast_config())
}

pub fn attach_with(sim: SimConfig, config: IocConfig) -> (Arc<SimIoc>, Arc<Ioc>) {
    let sim = Arc::new(SimIoc::new(sim));
    let ioc = new_ioc(&sim, config);
    ioc.bring_up().unwrap();
    (sim, Arc::new(ioc))
}

pub fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    poll_until(Duration::from_millis(1), Duration::from_secs(5), || {
        cond().then_some(())
    })
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}
