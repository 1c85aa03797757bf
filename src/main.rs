use std::sync::Arc;

use log::error;
use pingboard::{AppConfig, IcmpExecutor, MonitorEngine};

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let mut config = AppConfig::load();

    let mut json = false;
    let mut hosts = Vec::new();
    for arg in std::env::args().skip(1) {
        if arg == "--json" {
            json = true;
        } else {
            hosts.push(arg);
        }
    }
    if !hosts.is_empty() {
        config.hosts = hosts;
    }

    let schedule = config.schedule()?;
    let engine = MonitorEngine::new(Arc::new(IcmpExecutor::default()), config.window_settings())?;
    engine.start(&config.hosts, schedule)?;

    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    let printed: Result<(), Box<dyn std::error::Error>> = runtime.block_on(async {
        let mut ticker = tokio::time::interval(schedule.interval);
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => return Ok(()),
                _ = ticker.tick() => {
                    let snapshot = engine.snapshot();
                    if json {
                        println!("{}", serde_json::to_string(&*snapshot)?);
                    } else {
                        println!("{}", chrono::Local::now().format("%H:%M:%S"));
                        for host in &snapshot.hosts {
                            println!("  {}", host);
                        }
                    }
                }
            }
        }
    });

    engine.stop()?;
    printed
}
